pub mod detection;
pub mod fault;
pub mod telemetry;
pub mod upload;

use serde::{Deserialize, Serialize};

pub use detection::{DetectionResult, PixelBox, Target};
pub use fault::{ConfigError, Fault, FaultKind};
pub use telemetry::TelemetrySnapshot;
pub use upload::{FaultReport, SafetyTransition, UploadItem};

/// WGS84 position. Altitude is metres MSL when present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, alt: None }
    }

    pub fn with_alt(self, alt: f64) -> Self {
        Self { alt: Some(alt), ..self }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat.abs() <= 90.0
            && self.lon.abs() <= 180.0
            && self.alt.map(f64::is_finite).unwrap_or(true)
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.alt {
            Some(alt) => write!(f, "({:.6}, {:.6}, {:.1}m)", self.lat, self.lon, alt),
            None => write!(f, "({:.6}, {:.6})", self.lat, self.lon),
        }
    }
}

/// Wall clock in unix milliseconds.
pub fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
