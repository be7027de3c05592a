pub mod gateway;
pub mod mav;
pub mod policy;
pub mod safety;
pub mod state;
pub mod telemetry;

use serde::Deserialize;
use wing_proto::ConfigError;

pub use gateway::{Command, CommandGateway, CommandKind, Deferred, RecordingGateway, Severity};
pub use safety::{Decision, SafetyConfig, SafetyDecisionEngine, SafetyInputs, SafetyMonitors, SafetyState};
pub use telemetry::{TelemetryAssembler, TelemetryFeed};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    pub enable: bool,

    /// Full mavlink connection string ("serial:/dev/ttyAMA0:57600",
    /// "udpin:0.0.0.0:14550", ...). Takes precedence over serial_dev/baud.
    pub url: Option<String>,
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Hard safety: only allow these commands
    pub allow_rtl: bool,
    pub allow_hold: bool,
    pub allow_land: bool,
    pub allow_waypoint: bool,
    pub allow_arm: bool,

    /// Require seeing FC heartbeat before sending commands
    pub require_heartbeat: bool,
    pub min_command_interval_ms: u64,

    /// Companion heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,

    /// Consecutive receive errors tolerated before the reader gives up.
    pub max_recv_errors: u32,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            enable: true,
            url: None,
            serial_dev: Some("/dev/serial0".into()),
            baud: Some(57_600),
            sys_id: 1,
            comp_id: 191,
            target_sys: 1,
            target_comp: 1,
            allow_rtl: true,
            allow_hold: true,
            allow_land: true,
            allow_waypoint: true,
            allow_arm: false,
            require_heartbeat: true,
            min_command_interval_ms: 2_000,
            send_heartbeat_hz: None,
            max_recv_errors: 50,
        }
    }
}

impl FcConfig {
    pub fn connection_url(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        match (&self.serial_dev, self.baud) {
            (Some(dev), Some(baud)) if !dev.is_empty() => Some(format!("serial:{}:{}", dev, baud)),
            _ => None,
        }
    }

    pub fn check(&self) -> ConfigError {
        let mut e = ConfigError::default();
        if !self.enable {
            return e;
        }
        e.check(self.connection_url().is_some(), "fc: set fc.url or both fc.serial_dev and fc.baud");
        if let Some(b) = self.baud {
            e.check(b > 0, "fc.baud invalid");
        }
        e.check(self.sys_id != 0 && self.target_sys != 0, "fc: system ids must be non-zero");
        e.check(
            self.send_heartbeat_hz.map(|hz| hz >= 0.2 && hz <= 10.0).unwrap_or(true),
            "fc.send_heartbeat_hz should be 0.2..10",
        );
        e.check(self.allow_rtl || self.allow_land, "fc: at least one of allow_rtl/allow_land is required");
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_wins_over_serial() {
        let cfg = FcConfig { url: Some("udpin:0.0.0.0:14550".into()), ..Default::default() };
        assert_eq!(cfg.connection_url().as_deref(), Some("udpin:0.0.0.0:14550"));
        assert_eq!(FcConfig::default().connection_url().as_deref(), Some("serial:/dev/serial0:57600"));
    }

    #[test]
    fn disabled_fc_is_not_checked() {
        let cfg = FcConfig { enable: false, serial_dev: None, allow_rtl: false, allow_land: false, ..Default::default() };
        assert!(cfg.check().violations.is_empty());
        let cfg = FcConfig { serial_dev: None, allow_rtl: false, allow_land: false, ..Default::default() };
        assert_eq!(cfg.check().violations.len(), 2);
    }
}
