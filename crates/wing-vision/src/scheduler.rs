use std::time::Instant;

use anyhow::Result;
use tracing::debug;

use crate::tracker::BoxTracker;
use crate::{nms_filter, DetectConfig, Detection, Detector, RawFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectMode {
    /// Run the detector. Expensive, authoritative.
    Full,
    /// Extrapolate the last boxes. Cheap.
    Track,
}

/// Decides per frame between a full detect and box extrapolation.
#[derive(Debug, Clone)]
pub struct DetectScheduler {
    every_n: u32,
    conf_floor: f32,
    since_full: u32,
}

impl DetectScheduler {
    pub fn new(every_n: u32, conf_floor: f32) -> Self {
        Self { every_n: every_n.max(1), conf_floor, since_full: 0 }
    }

    /// `track_conf` is the best current track confidence, `None` without tracks.
    pub fn next_mode(&mut self, track_conf: Option<f32>) -> DetectMode {
        let due = self.since_full + 1 >= self.every_n;
        let weak = track_conf.map(|c| c < self.conf_floor).unwrap_or(true);
        if due || weak {
            self.since_full = 0;
            DetectMode::Full
        } else {
            self.since_full += 1;
            DetectMode::Track
        }
    }
}

/// Detector plus scheduler plus tracker: what the detection stage runs per
/// frame.
pub struct VisionEngine {
    detector: Box<dyn Detector>,
    cfg: DetectConfig,
    scheduler: DetectScheduler,
    tracker: BoxTracker,
}

impl VisionEngine {
    pub fn new(detector: Box<dyn Detector>, cfg: DetectConfig) -> Self {
        let scheduler = DetectScheduler::new(cfg.full_detect_every_n, cfg.track_conf_floor);
        let tracker = BoxTracker::new(cfg.track_iou_match, cfg.track_conf_decay, cfg.max_tracks);
        Self { detector, cfg, scheduler, tracker }
    }

    pub fn config(&self) -> &DetectConfig {
        &self.cfg
    }

    /// `captured` is the frame's capture instant, so extrapolation lands
    /// where the box was when the picture was taken.
    pub fn process(&mut self, frame: &RawFrame, captured: Instant) -> Result<(DetectMode, Vec<Detection>)> {
        let mode = self.scheduler.next_mode(self.tracker.confidence());
        let dets = match mode {
            DetectMode::Full => {
                let raw = self.detector.detect(frame)?;
                let n_raw = raw.len();
                let th = self.cfg.conf_threshold;
                let kept: Vec<Detection> = raw
                    .into_iter()
                    .filter(|d| d.confidence >= th && d.confidence <= 1.0 && d.bbox.width() > 0.0 && d.bbox.height() > 0.0)
                    .collect();
                let kept = nms_filter(kept, self.cfg.nms_iou_threshold, self.cfg.max_detections);
                debug!("full detect: {} raw, {} kept", n_raw, kept.len());
                self.tracker.observe(&kept, captured);
                kept
            }
            DetectMode::Track => self.tracker.extrapolate(captured, frame.width, frame.height),
        };
        Ok((mode, dets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use wing_proto::PixelBox;

    #[test]
    fn full_detect_every_n_frames_while_tracking_is_strong() {
        let mut s = DetectScheduler::new(3, 0.3);
        let modes: Vec<_> = (0..6).map(|_| s.next_mode(Some(0.9))).collect();
        use DetectMode::*;
        assert_eq!(modes, vec![Track, Track, Full, Track, Track, Full]);
    }

    #[test]
    fn missing_or_weak_track_forces_full_detect() {
        let mut s = DetectScheduler::new(10, 0.3);
        assert_eq!(s.next_mode(None), DetectMode::Full);
        assert_eq!(s.next_mode(Some(0.8)), DetectMode::Track);
        assert_eq!(s.next_mode(Some(0.29)), DetectMode::Full);
        assert_eq!(DetectScheduler::new(1, 0.0).next_mode(Some(1.0)), DetectMode::Full);
    }

    struct Scripted {
        replies: VecDeque<Vec<Detection>>,
        calls: Arc<Mutex<u32>>,
    }

    impl Detector for Scripted {
        fn detect(&mut self, _frame: &RawFrame) -> Result<Vec<Detection>> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }

    fn d(conf: f32, x: f32) -> Detection {
        Detection { class_id: 0, confidence: conf, bbox: PixelBox { x1: x, y1: 0.0, x2: x + 20.0, y2: 20.0 } }
    }

    #[test]
    fn engine_filters_and_then_tracks() {
        let calls = Arc::new(Mutex::new(0));
        let det = Scripted {
            replies: VecDeque::from(vec![vec![d(0.9, 10.0), d(0.85, 11.0), d(0.1, 300.0)]]),
            calls: calls.clone(),
        };
        let cfg = DetectConfig { full_detect_every_n: 4, ..Default::default() };
        let mut eng = VisionEngine::new(Box::new(det), cfg);
        let frame = RawFrame::new(vec![0u8; 4], 640, 480);
        let t0 = Instant::now();

        let (mode, dets) = eng.process(&frame, t0).unwrap();
        assert_eq!(mode, DetectMode::Full);
        // duplicate suppressed, low confidence dropped
        assert_eq!(dets, vec![d(0.9, 10.0)]);

        let (mode, dets) = eng.process(&frame, t0 + Duration::from_millis(200)).unwrap();
        assert_eq!(mode, DetectMode::Track);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, d(0.9, 10.0).bbox);
        assert!(dets[0].confidence < 0.9);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn empty_detect_keeps_detecting() {
        let calls = Arc::new(Mutex::new(0));
        let det = Scripted { replies: VecDeque::new(), calls: calls.clone() };
        let mut eng = VisionEngine::new(Box::new(det), DetectConfig::default());
        let frame = RawFrame::new(vec![0u8; 4], 640, 480);
        for _ in 0..3 {
            let (mode, dets) = eng.process(&frame, Instant::now()).unwrap();
            assert_eq!(mode, DetectMode::Full);
            assert!(dets.is_empty());
        }
        assert_eq!(*calls.lock().unwrap(), 3);
    }
}
