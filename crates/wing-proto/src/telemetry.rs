use serde::{Deserialize, Serialize};

use crate::{Fault, GeoPoint};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NedVelocity {
    pub vn: f64,
    pub ve: f64,
    pub vd: f64,
}

/// Radians, aerospace convention (yaw 0 = north, positive clockwise).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub voltage: Option<f32>,      // Volts
    pub current: Option<f32>,      // Amps
    pub remaining: Option<u8>,     // Percent 0-100
}

impl BatteryStatus {
    /// Instantaneous draw in watts, when both voltage and current are known.
    pub fn power_w(&self) -> Option<f64> {
        match (self.voltage, self.current) {
            (Some(v), Some(i)) if v > 0.0 && i >= 0.0 => Some(v as f64 * i as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsStatus {
    /// 0 = no gps, 1 = no fix, 2 = 2D, 3 = 3D, >3 = DGPS/RTK
    pub fix_type: u8,
    pub satellites: u8,
    pub hdop: f32,
}

impl Default for GpsStatus {
    fn default() -> Self {
        Self { fix_type: 0, satellites: 0, hdop: 99.9 }
    }
}

impl GpsStatus {
    pub fn has_3d_fix(&self) -> bool {
        self.fix_type >= 3
    }
}

/// Presence and age of the two control links as seen by the FC reader.
/// An age of `None` means the link has never been heard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub rc_present: bool,
    pub rc_age_ms: Option<u64>,
    pub gcs_present: bool,
    pub gcs_age_ms: Option<u64>,
}

/// One complete, immutable vehicle state. Published whole by a single writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub lat: f64,
    pub lon: f64,
    /// metres MSL
    pub alt_m: f64,
    /// metres above home
    pub rel_alt_m: f64,
    pub velocity: NedVelocity,
    pub attitude: Attitude,
    pub battery: BatteryStatus,
    pub gps: GpsStatus,
    pub links: LinkStatus,
    /// Set when this value is a republished last-known-good after a
    /// malformed update was discarded.
    #[serde(default)]
    pub stale: bool,
}

impl TelemetrySnapshot {
    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon).with_alt(self.alt_m)
    }

    pub fn groundspeed_mps(&self) -> f64 {
        self.velocity.vn.hypot(self.velocity.ve)
    }

    /// Rejects values that must never reach the safety engines.
    pub fn validate(&self) -> Result<(), Fault> {
        let mut bad = Vec::new();
        if !self.position().is_valid() {
            bad.push(format!("position ({}, {}, {})", self.lat, self.lon, self.alt_m));
        }
        if !self.rel_alt_m.is_finite() {
            bad.push("rel_alt_m not finite".to_string());
        }
        let v = &self.velocity;
        if !(v.vn.is_finite() && v.ve.is_finite() && v.vd.is_finite()) {
            bad.push("velocity not finite".to_string());
        }
        let a = &self.attitude;
        if !(a.roll.is_finite() && a.pitch.is_finite() && a.yaw.is_finite()) {
            bad.push("attitude not finite".to_string());
        }
        if let Some(r) = self.battery.remaining {
            if r > 100 {
                bad.push(format!("battery remaining {}%", r));
            }
        }
        if !self.gps.hdop.is_finite() || self.gps.hdop < 0.0 {
            bad.push(format!("hdop {}", self.gps.hdop));
        }
        if bad.is_empty() {
            Ok(())
        } else {
            Err(Fault::Protocol(bad.join("; ")))
        }
    }
}
