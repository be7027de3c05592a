//! Priority-ordered safety state machine.
//!
//! Each tick the monitors are evaluated into plain values ([`SafetyInputs`]),
//! per-condition latches apply hysteresis, and the highest active condition
//! becomes the state. A command is issued only when the state, or the kind
//! of command that state calls for, changes.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use wing_nav::{
    EnergyBudgetEngine, EnergyEstimate, EnergyResponse, EnergyTier, FenceAction, FenceCheck, GeofenceEngine,
    LinkHealth, LinkHealthMonitor,
};
use wing_proto::{now_unix_ms, SafetyTransition, TelemetrySnapshot};

use crate::gateway::{Command, CommandGateway, CommandKind, Deferred, Severity};

/// Lowest to highest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    Normal,
    BatteryWarning,
    LinkLost,
    GcsLostRcOk,
    GpsAnomaly,
    BatteryCritical,
    FenceBreach,
    Emergency,
}

impl SafetyState {
    pub fn name(&self) -> &'static str {
        match self {
            SafetyState::Normal => "NORMAL",
            SafetyState::BatteryWarning => "BATTERY_WARNING",
            SafetyState::LinkLost => "LINK_LOST",
            SafetyState::GcsLostRcOk => "GCS_LOST_RC_OK",
            SafetyState::GpsAnomaly => "GPS_ANOMALY",
            SafetyState::BatteryCritical => "BATTERY_CRITICAL",
            SafetyState::FenceBreach => "FENCE_BREACH",
            SafetyState::Emergency => "EMERGENCY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub tick_ms: u64,
    /// Clearance needed before a fence breach is considered over.
    pub fence_clear_margin_m: f64,
    /// Energy margin above a tier's threshold needed to leave it.
    pub battery_clear_margin_pct: f64,
    /// Consecutive clean ticks before a link condition clears.
    pub link_clear_ticks: u32,
    /// Per-cell voltage that means the pack is collapsing.
    pub emergency_cell_voltage: f64,
    pub loiter_radius_m: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            fence_clear_margin_m: 10.0,
            battery_clear_margin_pct: 5.0,
            link_clear_ticks: 3,
            emergency_cell_voltage: 3.0,
            loiter_radius_m: 50.0,
        }
    }
}

impl SafetyConfig {
    pub fn check(&self) -> wing_proto::ConfigError {
        let mut e = wing_proto::ConfigError::default();
        e.check(self.tick_ms > 0 && self.tick_ms <= 500, format!("safety.tick_ms {} must be 1..=500 (>= 2 Hz)", self.tick_ms));
        e.check(self.fence_clear_margin_m >= 0.0, "safety.fence_clear_margin_m must be >= 0");
        e.check(self.battery_clear_margin_pct >= 0.0, "safety.battery_clear_margin_pct must be >= 0");
        e.check(self.loiter_radius_m > 0.0, "safety.loiter_radius_m must be > 0");
        e
    }
}

/// Monitor outputs for one tick.
#[derive(Debug, Clone)]
pub struct SafetyInputs {
    pub fence: FenceCheck,
    pub energy: EnergyEstimate,
    /// Present when the energy tier is critical.
    pub energy_response: Option<EnergyResponse>,
    pub link: LinkHealth,
    /// Externally raised emergency (operator request, fatal fault).
    pub emergency: Option<String>,
}

/// Owns the three monitors and turns a snapshot into [`SafetyInputs`].
pub struct SafetyMonitors {
    pub geofence: GeofenceEngine,
    pub energy: EnergyBudgetEngine,
    pub link: LinkHealthMonitor,
}

impl SafetyMonitors {
    pub fn assess(&mut self, snap: &TelemetrySnapshot) -> SafetyInputs {
        let pos = snap.position();
        let fence = self.geofence.check_position(&pos, snap.alt_m);
        let energy = self.energy.update(snap);
        let energy_response = (energy.tier == EnergyTier::Critical).then(|| {
            let geofence = &self.geofence;
            self.energy.critical_response(&energy, &pos, |site| geofence.in_exclusion(site, 0.0))
        });
        let link = self.link.update(snap);
        SafetyInputs { fence, energy, energy_response, link, emergency: None }
    }
}

/// Schmitt latch: set by `trip`, cleared after `clear` holds `need`
/// consecutive times.
#[derive(Debug, Default, Clone, Copy)]
struct Latch {
    active: bool,
    clean: u32,
}

impl Latch {
    fn update(&mut self, trip: bool, clear: bool, need: u32) -> bool {
        if trip {
            self.active = true;
            self.clean = 0;
        } else if self.active {
            if clear {
                self.clean += 1;
                if self.clean >= need.max(1) {
                    self.active = false;
                    self.clean = 0;
                }
            } else {
                self.clean = 0;
            }
        }
        self.active
    }
}

#[derive(Debug, Default)]
struct Latches {
    emergency: Latch,
    fence: Latch,
    battery_critical: Latch,
    battery_warning: Latch,
    gcs_lost: Latch,
    link_lost: Latch,
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub state: SafetyState,
    pub previous: SafetyState,
    /// Command issued this tick, after any escalation.
    pub issued: Option<Command>,
    pub transition: Option<SafetyTransition>,
    /// Set when not even LAND could be sent.
    pub fault: Option<String>,
    /// Whether a remote operator may take control.
    pub remote_control_allowed: bool,
}

pub struct SafetyDecisionEngine {
    cfg: SafetyConfig,
    warn_margin_pct: f64,
    critical_margin_pct: f64,
    state: SafetyState,
    latches: Latches,
    last_command: Option<CommandKind>,
    reason: String,
}

impl SafetyDecisionEngine {
    /// `warn_margin_pct`/`critical_margin_pct` are the energy tier
    /// thresholds, used to place the recovery hysteresis.
    pub fn new(cfg: SafetyConfig, warn_margin_pct: f64, critical_margin_pct: f64) -> Self {
        Self {
            cfg,
            warn_margin_pct,
            critical_margin_pct,
            state: SafetyState::Normal,
            latches: Latches::default(),
            last_command: None,
            reason: String::new(),
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    /// Why the current state is active.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn resolve(&mut self, i: &SafetyInputs) -> (SafetyState, String) {
        let c = &self.cfg;
        let e = &i.energy;
        let collapse = e.cell_voltage.map(|v| v < c.emergency_cell_voltage).unwrap_or(false)
            || e.remaining_pct.map(|r| r <= 0.0).unwrap_or(false);
        let emergency_trip = collapse || i.emergency.is_some();

        let l = &mut self.latches;
        let emergency = l.emergency.update(emergency_trip, !emergency_trip, 1);
        let fence = l.fence.update(i.fence.breached, i.fence.clearance_m >= c.fence_clear_margin_m, 1);
        // an unknown battery neither trips nor clears the energy latches
        let critical = l.battery_critical.update(
            e.tier == EnergyTier::Critical,
            e.tier != EnergyTier::Critical && e.margin_pct >= self.critical_margin_pct + c.battery_clear_margin_pct,
            1,
        );
        let warning = l.battery_warning.update(
            e.tier >= EnergyTier::Warning,
            e.tier == EnergyTier::Ok && e.margin_pct >= self.warn_margin_pct + c.battery_clear_margin_pct,
            1,
        );
        let link_lost = l.link_lost.update(i.link.rc_lost, !i.link.rc_lost, c.link_clear_ticks);
        let gcs_lost = l.gcs_lost.update(i.link.gcs_lost, !i.link.gcs_lost, c.link_clear_ticks);

        if emergency {
            let why = i.emergency.clone().unwrap_or_else(|| format!("battery collapse ({:?} V/cell)", e.cell_voltage));
            (SafetyState::Emergency, why)
        } else if fence {
            let name = i.fence.fence.clone().unwrap_or_else(|| "recovering".into());
            (SafetyState::FenceBreach, format!("fence '{}' action {:?}", name, i.fence.action))
        } else if critical {
            (SafetyState::BatteryCritical, format!("energy margin {:.1}%", e.margin_pct))
        } else if i.link.gps_anomaly {
            (SafetyState::GpsAnomaly, format!("gps anomaly score {:.0}", i.link.anomaly_score))
        } else if gcs_lost && !link_lost {
            (SafetyState::GcsLostRcOk, format!("gcs silent {:?} ms", i.link.gcs_age_ms))
        } else if link_lost {
            (SafetyState::LinkLost, format!("rc silent {:?} ms", i.link.rc_age_ms))
        } else if warning {
            (SafetyState::BatteryWarning, format!("energy margin {:.1}%", e.margin_pct))
        } else {
            (SafetyState::Normal, String::new())
        }
    }

    fn command_for(&self, state: SafetyState, i: &SafetyInputs) -> Option<Command> {
        match state {
            SafetyState::Emergency => Some(Command::Land { at: None }),
            SafetyState::FenceBreach => match i.fence.action {
                Some(FenceAction::Warn) => Some(Command::Alert {
                    severity: Severity::Warning,
                    text: format!("FENCE {}", i.fence.fence.as_deref().unwrap_or("?")),
                }),
                Some(FenceAction::Loiter) => Some(Command::Loiter { radius_m: self.cfg.loiter_radius_m }),
                Some(FenceAction::GuidedReturn) => Some(match i.fence.nearest_safe_point {
                    Some(p) => Command::Waypoint { lat: p.lat, lon: p.lon, alt_m: p.alt.unwrap_or(0.0) as f32 },
                    None => Command::Rth,
                }),
                Some(FenceAction::Rth) => Some(Command::Rth),
                Some(FenceAction::Land) => Some(Command::Land { at: None }),
                // breach cleared but still inside the clearance margin
                None => None,
            },
            SafetyState::BatteryCritical => match i.energy_response {
                Some(EnergyResponse::Land { site }) => Some(Command::Land { at: site }),
                _ => Some(Command::Rth),
            },
            SafetyState::GpsAnomaly => Some(Command::Alert {
                severity: Severity::Critical,
                text: i
                    .link
                    .alert
                    .clone()
                    .unwrap_or_else(|| format!("GPS ANOMALY score {:.0}", i.link.anomaly_score)),
            }),
            SafetyState::GcsLostRcOk => Some(Command::Alert {
                severity: Severity::Warning,
                text: "GCS link lost, RC ok".into(),
            }),
            // FC failsafe owns RC loss
            SafetyState::LinkLost => None,
            SafetyState::BatteryWarning => Some(Command::Alert {
                severity: Severity::Warning,
                text: format!("BATTERY margin {:.0}%", i.energy.margin_pct),
            }),
            SafetyState::Normal => None,
        }
    }

    pub fn evaluate(&mut self, inputs: &SafetyInputs, gw: &mut dyn CommandGateway) -> Decision {
        let previous = self.state;
        let (state, reason) = self.resolve(inputs);
        let wanted = self.command_for(state, inputs);

        let changed = state != previous;
        let kind_changed = wanted.as_ref().map(|c| Some(c.kind()) != self.last_command).unwrap_or(false);

        let mut issued = None;
        let mut fault = None;
        if changed || kind_changed {
            match wanted {
                Some(cmd) => {
                    let kind = cmd.kind();
                    match self.dispatch(cmd, gw) {
                        Ok(Some(sent)) => {
                            self.last_command = Some(kind);
                            issued = Some(sent);
                        }
                        // rate-limited, retried next tick
                        Ok(None) => self.last_command = None,
                        Err(e) => {
                            // retried next tick
                            error!("safety: {}", e);
                            self.last_command = None;
                            fault = Some(e);
                        }
                    }
                }
                None => self.last_command = None,
            }
        }

        let transition = changed.then(|| {
            if state > previous {
                warn!("safety: {} -> {} ({})", previous.name(), state.name(), reason);
            } else {
                info!("safety: {} -> {} ({})", previous.name(), state.name(), reason);
            }
            SafetyTransition {
                ts_unix_ms: now_unix_ms(),
                from: previous.name().to_string(),
                to: state.name().to_string(),
                command: issued.as_ref().map(|c| c.to_string()),
                reason: reason.clone(),
            }
        });

        self.state = state;
        self.reason = reason;
        Decision {
            state,
            previous,
            issued,
            transition,
            fault,
            remote_control_allowed: !inputs.link.gcs_lost,
        }
    }

    /// Sends `cmd`, escalating to RTH and then LAND when the gateway refuses.
    /// `Ok(None)` means the gateway deferred it and nothing was sent.
    fn dispatch(&self, cmd: Command, gw: &mut dyn CommandGateway) -> Result<Option<Command>, String> {
        let mut chain = vec![cmd];
        match chain[0].kind() {
            CommandKind::Land => {}
            CommandKind::Rth => chain.push(Command::Land { at: None }),
            // alert-only states do not escalate into flight commands
            CommandKind::Alert => {}
            _ => {
                chain.push(Command::Rth);
                chain.push(Command::Land { at: None });
            }
        }

        let mut errors = Vec::new();
        for cmd in chain {
            match gw.execute(&cmd) {
                Ok(()) => {
                    if !errors.is_empty() {
                        warn!("safety: escalated to {} after: {}", cmd, errors.join("; "));
                    }
                    return Ok(Some(cmd));
                }
                Err(e) if e.downcast_ref::<Deferred>().is_some() => {
                    info!("safety: {} deferred", cmd);
                    return Ok(None);
                }
                Err(e) => errors.push(format!("{}: {:#}", cmd, e)),
            }
        }
        Err(format!("no resolvable safe action: {}", errors.join("; ")))
    }
}
