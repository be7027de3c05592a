//! Pixel → ground projection under a flat-earth assumption.
//!
//! The caller must pass the telemetry that was captured together with the
//! frame. Using a later snapshot shifts the target by however far the
//! aircraft moved during detection.

use serde::{Deserialize, Serialize};
use wing_proto::{GeoPoint, PixelBox, TelemetrySnapshot};

use crate::geo::LocalFrame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraModel {
    pub hfov_deg: f64,
    pub vfov_deg: f64,
    /// Mount pitch relative to the airframe; negative looks down.
    pub mount_pitch_deg: f64,
    /// Projections further out than this are discarded as unreliable.
    pub max_range_m: f64,
}

impl Default for CameraModel {
    fn default() -> Self {
        Self { hfov_deg: 54.0, vfov_deg: 41.0, mount_pitch_deg: -20.0, max_range_m: 2_000.0 }
    }
}

impl CameraModel {
    /// Ground position under the centre of `bbox`, or `None` when the ray
    /// does not hit the ground within range.
    pub fn project_bbox(&self, bbox: &PixelBox, width: u32, height: u32, snap: &TelemetrySnapshot) -> Option<GeoPoint> {
        let (cx, cy) = bbox.center();
        self.project_pixel(cx as f64, cy as f64, width, height, snap)
    }

    pub fn project_pixel(&self, px: f64, py: f64, width: u32, height: u32, snap: &TelemetrySnapshot) -> Option<GeoPoint> {
        if width == 0 || height == 0 || snap.rel_alt_m <= 0.0 {
            return None;
        }
        // normalised offsets in [-1, 1], +x right, +y down
        let nx = (px / width as f64 - 0.5) * 2.0;
        let ny = (py / height as f64 - 0.5) * 2.0;
        let az = (nx * self.hfov_deg / 2.0).to_radians();
        let el = (self.mount_pitch_deg - ny * self.vfov_deg / 2.0).to_radians();

        // body frame: x forward, y right, z down
        let body = [el.cos() * az.cos(), el.cos() * az.sin(), -el.sin()];
        let [n, e, d] = body_to_ned(&body, snap.attitude.roll, snap.attitude.pitch, snap.attitude.yaw);
        if d <= 1e-6 {
            return None;
        }

        let t = snap.rel_alt_m / d;
        let (north, east) = (n * t, e * t);
        if north.hypot(east) > self.max_range_m {
            return None;
        }
        let ground_alt = snap.alt_m - snap.rel_alt_m;
        Some(LocalFrame::new(&snap.position()).to_geo(east, north).with_alt(ground_alt))
    }
}

/// ZYX (yaw, pitch, roll) rotation of a body-frame vector into NED.
fn body_to_ned(v: &[f64; 3], roll: f64, pitch: f64, yaw: f64) -> [f64; 3] {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();
    let r = [
        [cy * cp, cy * sp * sr - sy * cr, cy * sp * cr + sy * sr],
        [sy * cp, sy * sp * sr + cy * cr, sy * sp * cr - cy * sr],
        [-sp, cp * sr, cp * cr],
    ];
    [
        r[0][0] * v[0] + r[0][1] * v[1] + r[0][2] * v[2],
        r[1][0] * v[0] + r[1][1] * v[1] + r[1][2] * v[2],
        r[2][0] * v[0] + r[2][1] * v[1] + r[2][2] * v[2],
    ]
}
