use serde::{Deserialize, Serialize};

use crate::GeoPoint;

/// Axis-aligned box in image pixels, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PixelBox {
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self { x1: self.x1 + dx, y1: self.y1 + dy, x2: self.x2 + dx, y2: self.y2 + dy }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub class_id: i32,
    pub confidence: f32,
    pub bbox: PixelBox,
    /// Ground position derived from the originating frame's telemetry.
    pub geo: Option<GeoPoint>,
    pub frame_id: u64,
    /// `seq` of the snapshot the geolocation was computed from.
    pub telemetry_seq: u64,
    pub ts_unix_ms: i64,
    /// True when produced by box extrapolation instead of a full detect.
    #[serde(default)]
    pub tracked: bool,
}

/// Wire record sent to the ground endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub timestamp: i64,
    pub class: String,
    pub confidence: f32,
    pub lat: f64,
    pub lon: f64,
    pub frame_id: u64,
}

impl Target {
    /// `None` when the detection could not be projected to the ground.
    pub fn from_detection(det: &DetectionResult, class: impl Into<String>) -> Option<Self> {
        let geo = det.geo?;
        Some(Self {
            timestamp: det.ts_unix_ms,
            class: class.into(),
            confidence: det.confidence,
            lat: geo.lat,
            lon: geo.lon,
            frame_id: det.frame_id,
        })
    }
}
