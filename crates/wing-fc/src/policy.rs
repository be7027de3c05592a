use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::gateway::{CommandKind, Deferred};
use crate::FcConfig;

/// Hard gate in front of the MAVLink link: per-command enables, the
/// heartbeat requirement, and a minimum spacing between identical commands.
#[derive(Debug)]
pub struct CommandPolicy {
    allow_arm: bool,
    allow_rth: bool,
    allow_loiter: bool,
    allow_land: bool,
    allow_waypoint: bool,
    require_heartbeat: bool,
    min_interval: Duration,
    last: HashMap<CommandKind, Instant>,
}

impl CommandPolicy {
    pub fn from_config(cfg: &FcConfig) -> Self {
        Self {
            allow_arm: cfg.allow_arm,
            allow_rth: cfg.allow_rtl,
            allow_loiter: cfg.allow_hold,
            allow_land: cfg.allow_land,
            allow_waypoint: cfg.allow_waypoint,
            require_heartbeat: cfg.require_heartbeat,
            min_interval: Duration::from_millis(cfg.min_command_interval_ms),
            last: HashMap::new(),
        }
    }

    /// `Err` when the command is refused outright, `Ok(false)` when an
    /// identical command went out too recently.
    pub fn permit(&mut self, kind: CommandKind, fc_alive: bool, now: Instant) -> Result<bool> {
        let enabled = match kind {
            CommandKind::Arm | CommandKind::Disarm | CommandKind::Takeoff => self.allow_arm,
            CommandKind::Rth => self.allow_rth,
            CommandKind::Loiter => self.allow_loiter,
            CommandKind::Land => self.allow_land,
            CommandKind::Waypoint => self.allow_waypoint,
            CommandKind::Alert => true,
        };
        if !enabled {
            anyhow::bail!("FC {:?} command disabled by config", kind);
        }
        if self.require_heartbeat && !fc_alive {
            anyhow::bail!("refusing {:?}: no FC heartbeat", kind);
        }
        if kind == CommandKind::Alert {
            return Ok(true);
        }
        if let Some(t) = self.last.get(&kind) {
            if now.duration_since(*t) < self.min_interval {
                return Ok(false);
            }
        }
        self.last.insert(kind, now);
        Ok(true)
    }

    /// Like [`permit`](Self::permit), but a rate-limited command is an
    /// [`Deferred`] error so the caller knows nothing was sent.
    pub fn admit(&mut self, kind: CommandKind, fc_alive: bool, now: Instant) -> Result<()> {
        if self.permit(kind, fc_alive, now)? {
            Ok(())
        } else {
            Err(Deferred(kind).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FcConfig {
        FcConfig { allow_waypoint: false, ..Default::default() }
    }

    #[test]
    fn identical_commands_are_spaced() {
        let mut p = CommandPolicy::from_config(&cfg());
        let t0 = Instant::now();
        assert!(p.permit(CommandKind::Rth, true, t0).unwrap());
        assert!(!p.permit(CommandKind::Rth, true, t0 + Duration::from_millis(500)).unwrap());
        assert!(p.permit(CommandKind::Loiter, true, t0 + Duration::from_millis(500)).unwrap());
        assert!(p.permit(CommandKind::Rth, true, t0 + Duration::from_secs(3)).unwrap());
    }

    #[test]
    fn disabled_and_headless_commands_are_refused() {
        let mut p = CommandPolicy::from_config(&cfg());
        let now = Instant::now();
        assert!(p.permit(CommandKind::Waypoint, true, now).is_err());
        assert!(p.permit(CommandKind::Rth, false, now).is_err());
    }

    #[test]
    fn spaced_out_command_is_reported_as_deferred() {
        let mut p = CommandPolicy::from_config(&cfg());
        let t0 = Instant::now();
        p.admit(CommandKind::Loiter, true, t0).unwrap();
        let err = p.admit(CommandKind::Loiter, true, t0 + Duration::from_millis(500)).unwrap_err();
        assert_eq!(err.downcast_ref::<Deferred>(), Some(&Deferred(CommandKind::Loiter)));
        // a refusal is not a deferral
        let err = p.admit(CommandKind::Waypoint, true, t0).unwrap_err();
        assert!(err.downcast_ref::<Deferred>().is_none());
        p.admit(CommandKind::Loiter, true, t0 + Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn alerts_are_never_rate_limited() {
        let mut p = CommandPolicy::from_config(&cfg());
        let now = Instant::now();
        assert!(p.permit(CommandKind::Alert, true, now).unwrap());
        assert!(p.permit(CommandKind::Alert, true, now).unwrap());
    }
}
