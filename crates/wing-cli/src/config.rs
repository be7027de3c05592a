use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use wing_fc::{FcConfig, SafetyConfig};
use wing_nav::geofence::templates;
use wing_nav::{doctor as nav_doctor, CameraModel, EnergyConfig, GeoFence, GeofenceConfig, LinkConfig};
use wing_pipeline::PipelineConfig;
use wing_proto::{ConfigError, GeoPoint};
use wing_uplink::{doctor as uplink_doctor, UplinkConfig};
use wing_vision::{CameraConfig, DetectConfig};

/// Whole-process configuration, one TOML file.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub geofence: GeofenceConfig,
    /// Fences generated from a shape, appended to `geofence.fences`.
    #[serde(default)]
    pub fence_templates: Vec<FenceTemplate>,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub fc: FcConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub camera_model: CameraModel,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub uplink: UplinkConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum FenceTemplate {
    Star {
        name: String,
        center: GeoPoint,
        radius_m: f64,
    },
    Circle {
        name: String,
        center: GeoPoint,
        radius_m: f64,
        #[serde(default = "default_segments")]
        segments: usize,
    },
    Rectangle {
        name: String,
        sw: GeoPoint,
        ne: GeoPoint,
    },
}

fn default_segments() -> usize {
    16
}

impl FenceTemplate {
    pub fn build(&self) -> GeoFence {
        match self {
            FenceTemplate::Star { name, center, radius_m } => templates::star(name, *center, *radius_m),
            FenceTemplate::Circle { name, center, radius_m, segments } => {
                templates::circle(name, *center, *radius_m, *segments)
            }
            FenceTemplate::Rectangle { name, sw, ne } => templates::rectangle(name, *sw, *ne),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// The configured fence set with every template expanded.
    pub fn fences(&self) -> GeofenceConfig {
        let mut g = self.geofence.clone();
        g.fences.extend(self.fence_templates.iter().map(FenceTemplate::build));
        g
    }

    pub fn home(&self) -> GeoPoint {
        self.geofence.home
    }

    /// Every violation across all sections, or `Ok` when there are none.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut e = ConfigError::default();
        e.merge(nav_doctor::check_geofence(&self.fences()));
        e.merge(nav_doctor::check_energy(&self.energy));
        e.merge(nav_doctor::check_link(&self.link));
        e.merge(self.safety.check());
        e.merge(self.fc.check());
        if self.detect.enable {
            e.merge(self.camera.check());
            e.merge(nav_doctor::check_camera(&self.camera_model));
            e.merge(self.detect.check());
        }
        e.merge(uplink_doctor::check_uplink(&self.uplink));
        e.merge(self.pipeline.check());
        // each wait inside the safety loop also counts against the watchdog
        e.check(
            self.safety.tick_ms < self.pipeline.watchdog_timeout_s * 500,
            "safety.tick_ms must be below half the watchdog timeout",
        );
        e.into_result()
    }
}
