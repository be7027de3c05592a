use std::time::Instant;

use wing_proto::PixelBox;

use crate::nms::iou;
use crate::Detection;

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub class_id: i32,
    /// Confidence at the last full detect.
    pub observed_conf: f32,
    pub observed: PixelBox,
    pub observed_at: Instant,

    // pixels per second, constant-velocity model
    pub vx: f32,
    pub vy: f32,

    pub hits: u32,
    /// Frames extrapolated since the last full detect.
    pub coasted: u32,
}

impl Track {
    pub fn confidence(&self, decay: f32) -> f32 {
        self.observed_conf * decay.powi(self.coasted as i32)
    }

    fn predict(&self, at: Instant) -> PixelBox {
        let dt = at.saturating_duration_since(self.observed_at).as_secs_f32();
        self.observed.translate(self.vx * dt, self.vy * dt)
    }
}

/// Carries the last full-detect boxes forward between detections.
#[derive(Debug, Clone)]
pub struct BoxTracker {
    iou_match: f32,
    conf_decay: f32,
    max_tracks: usize,
    next_id: u64,
    tracks: Vec<Track>,
}

impl BoxTracker {
    pub fn new(iou_match: f32, conf_decay: f32, max_tracks: usize) -> Self {
        Self { iou_match, conf_decay, max_tracks: max_tracks.max(1), next_id: 1, tracks: vec![] }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Best current track confidence, `None` without tracks.
    pub fn confidence(&self) -> Option<f32> {
        self.tracks.iter().map(|t| t.confidence(self.conf_decay)).reduce(f32::max)
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Folds in an authoritative full-detect result. Tracks that find no
    /// detection are dropped; a full detect is the truth.
    pub fn observe(&mut self, dets: &[Detection], at: Instant) {
        let mut next = Vec::with_capacity(dets.len().min(self.max_tracks));
        let mut used = vec![false; self.tracks.len()];

        for d in dets {
            if next.len() >= self.max_tracks {
                break;
            }
            // greedy association against the predicted boxes
            let mut best: Option<(usize, f32)> = None;
            for (i, t) in self.tracks.iter().enumerate() {
                if used[i] || t.class_id != d.class_id {
                    continue;
                }
                let o = iou(&t.predict(at), &d.bbox);
                if o >= self.iou_match && best.map(|(_, b)| o > b).unwrap_or(true) {
                    best = Some((i, o));
                }
            }

            let track = match best {
                Some((i, _)) => {
                    used[i] = true;
                    let t = &self.tracks[i];
                    let dt = at.saturating_duration_since(t.observed_at).as_secs_f32();
                    let (mut vx, mut vy) = (t.vx, t.vy);
                    if dt > 1e-3 {
                        let (ox, oy) = t.observed.center();
                        let (nx, ny) = d.bbox.center();
                        vx = 0.7 * vx + 0.3 * (nx - ox) / dt;
                        vy = 0.7 * vy + 0.3 * (ny - oy) / dt;
                    }
                    Track {
                        id: t.id,
                        class_id: d.class_id,
                        observed_conf: d.confidence,
                        observed: d.bbox,
                        observed_at: at,
                        vx,
                        vy,
                        hits: t.hits + 1,
                        coasted: 0,
                    }
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    Track {
                        id,
                        class_id: d.class_id,
                        observed_conf: d.confidence,
                        observed: d.bbox,
                        observed_at: at,
                        vx: 0.0,
                        vy: 0.0,
                        hits: 1,
                        coasted: 0,
                    }
                }
            };
            next.push(track);
        }
        self.tracks = next;
    }

    /// Moves every track to `at` and returns the extrapolated boxes with
    /// decayed confidence. Tracks that left the frame are dropped.
    pub fn extrapolate(&mut self, at: Instant, width: u32, height: u32) -> Vec<Detection> {
        let (w, h) = (width as f32, height as f32);
        let decay = self.conf_decay;
        let mut out = Vec::with_capacity(self.tracks.len());
        self.tracks.retain_mut(|t| {
            t.coasted += 1;
            let b = t.predict(at);
            if b.x2 <= 0.0 || b.y2 <= 0.0 || b.x1 >= w || b.y1 >= h {
                return false;
            }
            let bbox = PixelBox { x1: b.x1.max(0.0), y1: b.y1.max(0.0), x2: b.x2.min(w), y2: b.y2.min(h) };
            out.push(Detection { class_id: t.class_id, confidence: t.confidence(decay), bbox });
            true
        });
        out
    }
}
