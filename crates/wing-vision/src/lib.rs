pub mod camera;
pub mod external;
mod nms;
pub mod scheduler;
pub mod tracker;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use wing_proto::{ConfigError, PixelBox};

pub use camera::{CameraConfig, FrameSource, SubprocessCamera};
pub use external::ExternalDetector;
pub use nms::{iou, nms_filter};
pub use scheduler::{DetectMode, DetectScheduler, VisionEngine};
pub use tracker::BoxTracker;

/// One encoded image as it came off the camera.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Encoded bytes (JPEG from the capture helpers). Cheap to clone.
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self { data: data.into(), width, height }
    }
}

/// Detector output in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: i32,
    pub confidence: f32,
    pub bbox: PixelBox,
}

/// Object detector. The model behind it is opaque to the rest of the system;
/// only the `(class_id, confidence, bbox)` contract matters.
pub trait Detector: Send {
    fn detect(&mut self, frame: &RawFrame) -> Result<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &RawFrame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub enable: bool,

    /// Detector process, spoken to over stdin/stdout (see `external`).
    pub command: Vec<String>,
    pub class_names: Vec<String>,

    pub conf_threshold: f32,
    pub nms_iou_threshold: f32,
    pub max_detections: usize,

    /// Full detect on every Nth frame, track in between.
    pub full_detect_every_n: u32,
    /// Track confidence below this forces a full detect.
    pub track_conf_floor: f32,
    /// Multiplied into track confidence per extrapolated frame.
    pub track_conf_decay: f32,
    pub track_iou_match: f32,
    pub max_tracks: usize,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            enable: true,
            command: Vec::new(),
            class_names: vec!["person".into(), "vehicle".into()],
            conf_threshold: 0.35,
            nms_iou_threshold: 0.45,
            max_detections: 20,
            full_detect_every_n: 5,
            track_conf_floor: 0.3,
            track_conf_decay: 0.9,
            track_iou_match: 0.3,
            max_tracks: 16,
        }
    }
}

impl DetectConfig {
    pub fn class_name(&self, class_id: i32) -> String {
        usize::try_from(class_id)
            .ok()
            .and_then(|i| self.class_names.get(i))
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    pub fn check(&self) -> ConfigError {
        let mut e = ConfigError::default();
        if !self.enable {
            return e;
        }
        e.check(!self.command.is_empty(), "detect.command must name the detector executable");
        e.check((0.0..=1.0).contains(&self.conf_threshold), "detect.conf_threshold should be 0..1");
        e.check((0.0..=1.0).contains(&self.nms_iou_threshold), "detect.nms_iou_threshold should be 0..1");
        e.check(self.max_detections > 0, "detect.max_detections must be > 0");
        e.check(self.full_detect_every_n >= 1, "detect.full_detect_every_n must be >= 1");
        e.check(
            self.track_conf_decay > 0.0 && self.track_conf_decay <= 1.0,
            "detect.track_conf_decay should be in (0, 1]",
        );
        e.check((0.0..=1.0).contains(&self.track_conf_floor), "detect.track_conf_floor should be 0..1");
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_names_fall_back_to_ids() {
        let cfg = DetectConfig::default();
        assert_eq!(cfg.class_name(1), "vehicle");
        assert_eq!(cfg.class_name(7), "class_7");
        assert_eq!(cfg.class_name(-1), "class_-1");
    }

    #[test]
    fn enabled_detector_needs_a_command() {
        let cfg = DetectConfig { full_detect_every_n: 0, ..Default::default() };
        assert_eq!(cfg.check().violations.len(), 2);
        let off = DetectConfig { enable: false, ..cfg };
        assert!(off.check().violations.is_empty());
    }
}
