use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use wing_proto::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// One high-level request to the flight controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Arm,
    Disarm,
    Takeoff { alt_m: f32 },
    Land { at: Option<GeoPoint> },
    Rth,
    Loiter { radius_m: f32 },
    Waypoint { lat: f64, lon: f64, alt_m: f32 },
    Alert { severity: Severity, text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Arm,
    Disarm,
    Takeoff,
    Land,
    Rth,
    Loiter,
    Waypoint,
    Alert,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Arm => CommandKind::Arm,
            Command::Disarm => CommandKind::Disarm,
            Command::Takeoff { .. } => CommandKind::Takeoff,
            Command::Land { .. } => CommandKind::Land,
            Command::Rth => CommandKind::Rth,
            Command::Loiter { .. } => CommandKind::Loiter,
            Command::Waypoint { .. } => CommandKind::Waypoint,
            Command::Alert { .. } => CommandKind::Alert,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Arm => write!(f, "ARM"),
            Command::Disarm => write!(f, "DISARM"),
            Command::Takeoff { alt_m } => write!(f, "TAKEOFF {alt_m:.0}m"),
            Command::Land { at: Some(p) } => write!(f, "LAND at {p}"),
            Command::Land { at: None } => write!(f, "LAND here"),
            Command::Rth => write!(f, "RTH"),
            Command::Loiter { radius_m } => write!(f, "LOITER r={radius_m:.0}m"),
            Command::Waypoint { lat, lon, alt_m } => write!(f, "WAYPOINT ({lat:.6}, {lon:.6}, {alt_m:.0}m)"),
            Command::Alert { severity, text } => write!(f, "ALERT {severity:?}: {text}"),
        }
    }
}

/// Returned by a gateway that held a command back because an identical one
/// went out too recently. Nothing reached the FC; the caller re-issues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0:?} deferred, identical command sent too recently")]
pub struct Deferred(pub CommandKind);

/// Everything the autonomy core may ask of the flight controller.
///
/// Implementations must return promptly: the safety loop calls these from
/// its own tick and a blocked call delays the next evaluation.
pub trait CommandGateway: Send {
    fn arm(&mut self) -> Result<()>;
    fn disarm(&mut self) -> Result<()>;
    fn takeoff(&mut self, alt_m: f32) -> Result<()>;
    /// `None` lands at the current position.
    fn land(&mut self, at: Option<GeoPoint>) -> Result<()>;
    fn rth(&mut self) -> Result<()>;
    fn loiter(&mut self, radius_m: f32) -> Result<()>;
    fn waypoint(&mut self, lat: f64, lon: f64, alt_m: f32) -> Result<()>;
    fn alert(&mut self, severity: Severity, text: &str) -> Result<()>;

    fn execute(&mut self, cmd: &Command) -> Result<()> {
        match cmd {
            Command::Arm => self.arm(),
            Command::Disarm => self.disarm(),
            Command::Takeoff { alt_m } => self.takeoff(*alt_m),
            Command::Land { at } => self.land(*at),
            Command::Rth => self.rth(),
            Command::Loiter { radius_m } => self.loiter(*radius_m),
            Command::Waypoint { lat, lon, alt_m } => self.waypoint(*lat, *lon, *alt_m),
            Command::Alert { severity, text } => self.alert(*severity, text),
        }
    }
}

/// Gateway that only logs and remembers what it was asked to do. Used when
/// no flight controller is attached, and by tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingGateway {
    sent: Arc<Mutex<Vec<Command>>>,
    failing: Arc<Mutex<Vec<CommandKind>>>,
    deferring: Arc<Mutex<Vec<CommandKind>>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Makes every later command of `kind` fail.
    pub fn fail(&self, kind: CommandKind) {
        self.failing.lock().unwrap_or_else(|p| p.into_inner()).push(kind);
    }

    /// Holds back the next command of `kind` once, as a rate limit would.
    pub fn defer_next(&self, kind: CommandKind) {
        self.deferring.lock().unwrap_or_else(|p| p.into_inner()).push(kind);
    }

    fn record(&mut self, cmd: Command) -> Result<()> {
        if self.failing.lock().unwrap_or_else(|p| p.into_inner()).contains(&cmd.kind()) {
            anyhow::bail!("{cmd} rejected");
        }
        {
            let mut deferring = self.deferring.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(i) = deferring.iter().position(|k| *k == cmd.kind()) {
                deferring.remove(i);
                return Err(Deferred(cmd.kind()).into());
            }
        }
        info!("gateway(dry): {}", cmd);
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).push(cmd);
        Ok(())
    }
}

impl CommandGateway for RecordingGateway {
    fn arm(&mut self) -> Result<()> { self.record(Command::Arm) }
    fn disarm(&mut self) -> Result<()> { self.record(Command::Disarm) }
    fn takeoff(&mut self, alt_m: f32) -> Result<()> { self.record(Command::Takeoff { alt_m }) }
    fn land(&mut self, at: Option<GeoPoint>) -> Result<()> { self.record(Command::Land { at }) }
    fn rth(&mut self) -> Result<()> { self.record(Command::Rth) }
    fn loiter(&mut self, radius_m: f32) -> Result<()> { self.record(Command::Loiter { radius_m }) }
    fn waypoint(&mut self, lat: f64, lon: f64, alt_m: f32) -> Result<()> {
        self.record(Command::Waypoint { lat, lon, alt_m })
    }
    fn alert(&mut self, severity: Severity, text: &str) -> Result<()> {
        self.record(Command::Alert { severity, text: text.to_string() })
    }
}
