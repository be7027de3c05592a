use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All violations found while validating configuration, reported together.
#[derive(Debug, Clone, Default, Error)]
#[error("invalid configuration ({} problem(s)):\n  - {}", .violations.len(), .violations.join("\n  - "))]
pub struct ConfigError {
    pub violations: Vec<String>,
}

impl ConfigError {
    pub fn push(&mut self, v: impl Into<String>) {
        self.violations.push(v.into());
    }

    /// Records `msg` when `ok` is false.
    pub fn check(&mut self, ok: bool, msg: impl Into<String>) {
        if !ok {
            self.push(msg);
        }
    }

    pub fn merge(&mut self, other: ConfigError) {
        self.violations.extend(other.violations);
    }

    pub fn into_result(self) -> Result<(), ConfigError> {
        if self.violations.is_empty() { Ok(()) } else { Err(self) }
    }
}

#[derive(Debug, Error)]
pub enum Fault {
    #[error("transient i/o failure: {0}")]
    TransientIo(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("malformed telemetry: {0}")]
    Protocol(String),

    #[error("watchdog expired: no kick for {0:?}")]
    Liveness(Duration),

    #[error("no resolvable safe action: {0}")]
    Safety(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    TransientIo,
    Config,
    Protocol,
    Liveness,
    Safety,
    Fatal,
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::TransientIo(_) => FaultKind::TransientIo,
            Fault::Config(_) => FaultKind::Config,
            Fault::Protocol(_) => FaultKind::Protocol,
            Fault::Liveness(_) => FaultKind::Liveness,
            Fault::Safety(_) => FaultKind::Safety,
            Fault::Fatal(_) => FaultKind::Fatal,
        }
    }

    /// Faults that end the whole run instead of restarting one stage.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::Config(_) | Fault::Liveness(_) | Fault::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_lists_every_violation() {
        let mut e = ConfigError::default();
        e.check(false, "fence 'a' has 2 vertices");
        e.check(true, "never shown");
        e.push("watchdog timeout is zero");
        let err = e.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("2 problem(s)"));
        assert!(text.contains("fence 'a' has 2 vertices"));
        assert!(text.contains("watchdog timeout is zero"));
        assert!(!text.contains("never shown"));
    }

    #[test]
    fn only_config_liveness_and_fatal_end_the_run() {
        assert!(!Fault::TransientIo("x".into()).is_fatal());
        assert!(!Fault::Protocol("x".into()).is_fatal());
        assert!(!Fault::Safety("x".into()).is_fatal());
        assert!(Fault::Liveness(Duration::from_secs(60)).is_fatal());
        assert!(Fault::Fatal("x".into()).is_fatal());
        assert_eq!(Fault::Config(ConfigError::default()).kind(), FaultKind::Config);
    }
}
