use std::time::Instant;

use anyhow::Result;
use mavlink::common::{MavMessage, MavType};
use mavlink::MavHeader;
use wing_proto::telemetry::{Attitude, NedVelocity};
use wing_proto::{now_unix_ms, TelemetrySnapshot};

/// Blocking source of complete vehicle snapshots, nominally at >= 10 Hz.
pub trait TelemetryFeed: Send {
    fn next_snapshot(&mut self) -> Result<TelemetrySnapshot>;
}

/// Folds individual MAVLink messages into whole snapshots. A snapshot is
/// emitted on every GLOBAL_POSITION_INT, carrying the latest value of every
/// other field.
#[derive(Debug)]
pub struct TelemetryAssembler {
    target_sys: u8,
    working: TelemetrySnapshot,
    seq: u64,
    last_rc: Option<Instant>,
    last_gcs: Option<Instant>,
}

impl TelemetryAssembler {
    pub fn new(target_sys: u8) -> Self {
        Self { target_sys, working: TelemetrySnapshot::default(), seq: 0, last_rc: None, last_gcs: None }
    }

    /// Returns true when `msg` completes a new position sample.
    pub fn ingest(&mut self, hdr: &MavHeader, msg: &MavMessage, now: Instant) -> bool {
        if let MavMessage::HEARTBEAT(hb) = msg {
            if hb.mavtype == MavType::MAV_TYPE_GCS {
                self.last_gcs = Some(now);
            }
            return false;
        }
        if hdr.system_id != self.target_sys {
            return false;
        }
        let w = &mut self.working;
        match msg {
            MavMessage::GLOBAL_POSITION_INT(p) => {
                w.lat = p.lat as f64 / 1e7;
                w.lon = p.lon as f64 / 1e7;
                w.alt_m = p.alt as f64 / 1000.0;
                w.rel_alt_m = p.relative_alt as f64 / 1000.0;
                w.velocity = NedVelocity {
                    vn: p.vx as f64 / 100.0,
                    ve: p.vy as f64 / 100.0,
                    vd: p.vz as f64 / 100.0,
                };
                return true;
            }
            MavMessage::ATTITUDE(a) => {
                w.attitude = Attitude { roll: a.roll as f64, pitch: a.pitch as f64, yaw: a.yaw as f64 };
            }
            MavMessage::SYS_STATUS(status) => {
                // voltage_battery is in millivolts
                if status.voltage_battery != u16::MAX {
                    w.battery.voltage = Some(status.voltage_battery as f32 / 1000.0);
                }
                // centiamps, -1 means invalid
                if status.current_battery != -1 {
                    w.battery.current = Some(status.current_battery as f32 / 100.0);
                }
                if (0..=100).contains(&status.battery_remaining) {
                    w.battery.remaining = Some(status.battery_remaining as u8);
                }
            }
            MavMessage::GPS_RAW_INT(g) => {
                w.gps.fix_type = g.fix_type as u8;
                w.gps.satellites = if g.satellites_visible == u8::MAX { 0 } else { g.satellites_visible };
                // eph is HDOP * 100, UINT16_MAX when unknown
                w.gps.hdop = if g.eph == u16::MAX { 99.9 } else { g.eph as f32 / 100.0 };
            }
            MavMessage::RC_CHANNELS(rc) => {
                if rc.chancount > 0 && rc.rssi != 0 {
                    self.last_rc = Some(now);
                }
            }
            _ => {}
        }
        false
    }

    pub fn snapshot(&mut self, now: Instant) -> TelemetrySnapshot {
        self.seq += 1;
        let mut s = self.working.clone();
        s.seq = self.seq;
        s.ts_unix_ms = now_unix_ms();
        s.links.rc_present = self.last_rc.is_some();
        s.links.rc_age_ms = self.last_rc.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        s.links.gcs_present = self.last_gcs.is_some();
        s.links.gcs_age_ms = self.last_gcs.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::GpsFixType;
    use mavlink::Message;
    use std::time::Duration;

    fn hdr(sys: u8) -> MavHeader {
        MavHeader { system_id: sys, component_id: 1, sequence: 0 }
    }

    fn msg(id: u32, edit: impl FnOnce(&mut MavMessage)) -> MavMessage {
        let mut m = MavMessage::default_message_from_id(id).unwrap();
        edit(&mut m);
        m
    }

    #[test]
    fn position_message_completes_a_snapshot() {
        let mut asm = TelemetryAssembler::new(1);
        let t0 = Instant::now();

        let gps = msg(24, |m| {
            if let MavMessage::GPS_RAW_INT(g) = m {
                g.fix_type = GpsFixType::GPS_FIX_TYPE_3D_FIX;
                g.satellites_visible = 11;
                g.eph = 87;
            }
        });
        assert!(!asm.ingest(&hdr(1), &gps, t0));

        let sys = msg(1, |m| {
            if let MavMessage::SYS_STATUS(s) = m {
                s.voltage_battery = 15_200;
                s.current_battery = 1_250;
                s.battery_remaining = 64;
            }
        });
        assert!(!asm.ingest(&hdr(1), &sys, t0));

        let pos = msg(33, |m| {
            if let MavMessage::GLOBAL_POSITION_INT(p) = m {
                p.lat = 210_285_110;
                p.lon = 1_058_048_170;
                p.alt = 130_000;
                p.relative_alt = 100_000;
                p.vx = 1_500;
            }
        });
        assert!(asm.ingest(&hdr(1), &pos, t0));

        let s = asm.snapshot(t0);
        assert_eq!(s.seq, 1);
        assert!((s.lat - 21.028511).abs() < 1e-9);
        assert_eq!(s.rel_alt_m, 100.0);
        assert_eq!(s.velocity.vn, 15.0);
        assert_eq!(s.gps.fix_type, 3);
        assert_eq!(s.gps.satellites, 11);
        assert!((s.gps.hdop - 0.87).abs() < 1e-6);
        assert_eq!(s.battery.remaining, Some(64));
        assert!((s.battery.current.unwrap() - 12.5).abs() < 1e-6);
        assert!(!s.links.rc_present);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn other_systems_are_ignored_except_gcs_heartbeat() {
        let mut asm = TelemetryAssembler::new(1);
        let t0 = Instant::now();
        let pos = msg(33, |m| {
            if let MavMessage::GLOBAL_POSITION_INT(p) = m {
                p.lat = 10;
            }
        });
        assert!(!asm.ingest(&hdr(7), &pos, t0));

        let hb = msg(0, |m| {
            if let MavMessage::HEARTBEAT(h) = m {
                h.mavtype = MavType::MAV_TYPE_GCS;
            }
        });
        asm.ingest(&hdr(255), &hb, t0);
        let s = asm.snapshot(t0 + Duration::from_millis(400));
        assert!(s.links.gcs_present);
        assert_eq!(s.links.gcs_age_ms, Some(400));
        assert_eq!(s.lat, 0.0);
    }

    #[test]
    fn rc_counts_only_with_channels_and_signal() {
        let mut asm = TelemetryAssembler::new(1);
        let t0 = Instant::now();
        let dead = msg(65, |m| {
            if let MavMessage::RC_CHANNELS(rc) = m {
                rc.chancount = 0;
                rc.rssi = 0;
            }
        });
        asm.ingest(&hdr(1), &dead, t0);
        assert!(!asm.snapshot(t0).links.rc_present);

        let live = msg(65, |m| {
            if let MavMessage::RC_CHANNELS(rc) = m {
                rc.chancount = 8;
                rc.rssi = 200;
            }
        });
        asm.ingest(&hdr(1), &live, t0);
        let s = asm.snapshot(t0 + Duration::from_millis(50));
        assert_eq!(s.links.rc_age_ms, Some(50));
        assert_eq!(s.seq, 2);
    }
}
