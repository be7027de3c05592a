use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mavlink::{
    common::{
        MavMessage, HEARTBEAT_DATA, MavAutopilot, MavModeFlag, MavState, MavSeverity,
        COMMAND_INT_DATA, COMMAND_LONG_DATA, MavCmd, MavFrame, MavType,
    },
    MavConnection, MavHeader, Message,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};
use wing_proto::{GeoPoint, TelemetrySnapshot};

use crate::gateway::{CommandGateway, CommandKind, Severity};
use crate::policy::CommandPolicy;
use crate::state::FcStatus;
use crate::telemetry::{TelemetryAssembler, TelemetryFeed};
use crate::FcConfig;

const STATUSTEXT_ID: u32 = 253;
const STATUSTEXT_LEN: usize = 50;

/// An FC heartbeat older than this means the FC is not listening.
const FC_ALIVE_WINDOW: Duration = Duration::from_secs(3);

struct Shared {
    conn: Box<dyn MavConnection<MavMessage> + Sync + Send>,
    sys_id: u8,
    comp_id: u8,
    seq: AtomicU8,
    status: Mutex<FcStatus>,
}

impl Shared {
    fn send(&self, msg: MavMessage) -> Result<()> {
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.conn.send(&hdr, &msg).context("mavlink send")?;
        Ok(())
    }

    fn status(&self) -> std::sync::MutexGuard<'_, FcStatus> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Command side of the flight-controller link.
pub struct FcLink {
    shared: Arc<Shared>,
    target_sys: u8,
    target_comp: u8,
    policy: CommandPolicy,
}

/// Read side: turns the MAVLink stream into snapshots and keeps the
/// companion heartbeat going.
pub struct FcReader {
    shared: Arc<Shared>,
    assembler: TelemetryAssembler,
    target_sys: u8,
    hb_interval: Duration,
    last_hb_send: Option<Instant>,
    max_recv_errors: u32,
    consecutive_errors: u32,
}

impl FcLink {
    /// Opens one connection and splits it into its command and read halves.
    pub fn open(cfg: &FcConfig) -> Result<(FcLink, FcReader)> {
        let url = cfg.connection_url().context("fc: no connection configured")?;

        if let (None, Some(dev), Some(baud)) = (&cfg.url, &cfg.serial_dev, cfg.baud) {
            // quick validate device
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open fc serial device {}", dev))?;
        }

        let conn = mavlink::connect::<MavMessage>(&url)
            .with_context(|| format!("mavlink connect {}", url))?;
        info!("FC: connected via {}", url);

        let shared = Arc::new(Shared {
            conn,
            sys_id: cfg.sys_id,
            comp_id: cfg.comp_id,
            seq: AtomicU8::new(0),
            status: Mutex::new(FcStatus { endpoint: Some(url), ..Default::default() }),
        });
        let hb_hz = cfg.send_heartbeat_hz.unwrap_or(1.0).max(0.2);

        let link = FcLink {
            shared: shared.clone(),
            target_sys: cfg.target_sys,
            target_comp: cfg.target_comp,
            policy: CommandPolicy::from_config(cfg),
        };
        let reader = FcReader {
            shared,
            assembler: TelemetryAssembler::new(cfg.target_sys),
            target_sys: cfg.target_sys,
            hb_interval: Duration::from_secs_f32(1.0 / hb_hz),
            last_hb_send: None,
            max_recv_errors: cfg.max_recv_errors.max(1),
            consecutive_errors: 0,
        };
        Ok((link, reader))
    }

    pub fn status(&self) -> FcStatus {
        self.shared.status().clone()
    }

    /// Policy gate shared by every flight command. A rate-limited command
    /// comes back as [`Deferred`](crate::gateway::Deferred).
    fn admit(&mut self, kind: CommandKind) -> Result<()> {
        let alive = self.shared.status().alive(FC_ALIVE_WINDOW);
        if let Err(e) = self.policy.admit(kind, alive, Instant::now()) {
            warn!("FC: {:#}", e);
            return Err(e);
        }
        Ok(())
    }

    fn command(&mut self, kind: CommandKind, cmd: MavCmd, params: [f32; 7]) -> Result<()> {
        self.admit(kind)?;
        let msg = COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command: cmd.into(),
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        };
        info!("FC: sending {:?}", kind);
        self.shared.send(MavMessage::COMMAND_LONG(msg))
    }

    /// Positional commands go as COMMAND_INT so coordinates keep their
    /// 1e-7 degree resolution.
    fn command_at(&mut self, kind: CommandKind, cmd: MavCmd, params: [f32; 4], at: GeoPoint, alt_m: f32) -> Result<()> {
        self.admit(kind)?;
        let msg = COMMAND_INT_DATA {
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            x: deg_e7(at.lat),
            y: deg_e7(at.lon),
            z: alt_m,
            command: cmd,
            target_system: self.target_sys,
            target_component: self.target_comp,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: 0,
            autocontinue: 0,
        };
        info!("FC: sending {:?} at {}", kind, at);
        self.shared.send(MavMessage::COMMAND_INT(msg))
    }
}

fn deg_e7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

impl CommandGateway for FcLink {
    fn arm(&mut self) -> Result<()> {
        self.command(CommandKind::Arm, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn disarm(&mut self) -> Result<()> {
        self.command(CommandKind::Disarm, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7])
    }

    fn takeoff(&mut self, alt_m: f32) -> Result<()> {
        self.command(CommandKind::Takeoff, MavCmd::MAV_CMD_NAV_TAKEOFF, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, alt_m])
    }

    fn land(&mut self, at: Option<GeoPoint>) -> Result<()> {
        match at {
            Some(site) => self.command_at(CommandKind::Land, MavCmd::MAV_CMD_NAV_LAND, [0.0; 4], site, 0.0),
            // lat/lon 0 = land where we are
            None => self.command(CommandKind::Land, MavCmd::MAV_CMD_NAV_LAND, [0.0; 7]),
        }
    }

    fn rth(&mut self) -> Result<()> {
        self.command(CommandKind::Rth, MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7])
    }

    fn loiter(&mut self, radius_m: f32) -> Result<()> {
        self.command(CommandKind::Loiter, MavCmd::MAV_CMD_NAV_LOITER_UNLIM, [0.0, 0.0, radius_m, 0.0, 0.0, 0.0, 0.0])
    }

    fn waypoint(&mut self, lat: f64, lon: f64, alt_m: f32) -> Result<()> {
        // param1 -1: keep current speed
        self.command_at(
            CommandKind::Waypoint,
            MavCmd::MAV_CMD_DO_REPOSITION,
            [-1.0, 0.0, 0.0, 0.0],
            GeoPoint::new(lat, lon),
            alt_m,
        )
    }

    fn alert(&mut self, severity: Severity, text: &str) -> Result<()> {
        self.policy.permit(CommandKind::Alert, true, Instant::now())?;
        let mut msg = MavMessage::default_message_from_id(STATUSTEXT_ID)
            .map_err(|e| anyhow::anyhow!("statustext: {}", e))?;
        if let MavMessage::STATUSTEXT(st) = &mut msg {
            st.severity = match severity {
                Severity::Info => MavSeverity::MAV_SEVERITY_INFO,
                Severity::Warning => MavSeverity::MAV_SEVERITY_WARNING,
                Severity::Critical => MavSeverity::MAV_SEVERITY_CRITICAL,
                Severity::Emergency => MavSeverity::MAV_SEVERITY_EMERGENCY,
            };
            let bytes = text.as_bytes();
            let n = bytes.len().min(STATUSTEXT_LEN);
            st.text[..n].copy_from_slice(&bytes[..n]);
        }
        info!("FC: alert {:?} '{}'", severity, text);
        self.shared.send(msg)
    }
}

impl FcReader {
    pub fn send_heartbeat(&self) -> Result<()> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.shared.send(MavMessage::HEARTBEAT(hb))
    }

    fn heartbeat_due(&mut self, now: Instant) {
        let due = self.last_hb_send.map(|t| now.duration_since(t) >= self.hb_interval).unwrap_or(true);
        if due {
            if let Err(e) = self.send_heartbeat() {
                debug!("companion heartbeat: {:#}", e);
            }
            self.last_hb_send = Some(now);
        }
    }
}

impl TelemetryFeed for FcReader {
    fn next_snapshot(&mut self) -> Result<TelemetrySnapshot> {
        loop {
            self.heartbeat_due(Instant::now());
            match self.shared.conn.recv() {
                Ok((hdr, msg)) => {
                    self.consecutive_errors = 0;
                    let now = Instant::now();
                    {
                        let mut st = self.shared.status();
                        st.connected = true;
                        st.messages += 1;
                        st.last_msg = Some(msg.message_name());
                        if hdr.system_id == self.target_sys && matches!(msg, MavMessage::HEARTBEAT(_)) {
                            st.last_heartbeat = Some(now);
                        }
                    }
                    if self.assembler.ingest(&hdr, &msg, now) {
                        return Ok(self.assembler.snapshot(now));
                    }
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    self.shared.status().recv_errors += 1;
                    if self.consecutive_errors >= self.max_recv_errors {
                        anyhow::bail!("mavlink recv failing ({} in a row): {}", self.consecutive_errors, e);
                    }
                    debug!("mavlink recv: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_keep_centimetre_resolution() {
        assert_eq!(deg_e7(105.8048173), 1_058_048_173);
        assert_eq!(deg_e7(-33.8688197), -338_688_197);
        // f32 cannot hold the same value
        assert_ne!((105.8048173f64 as f32 as f64 * 1e7).round() as i32, 1_058_048_173);
    }
}
