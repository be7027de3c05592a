use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::runtime::Handle;
use tracing::{debug, info};
use wing_fc::{CommandGateway, Decision, SafetyDecisionEngine, SafetyMonitors, TelemetryFeed};
use wing_nav::CameraModel;
use wing_proto::{now_unix_ms, DetectionResult, Fault, Target, TelemetrySnapshot, UploadItem};
use wing_uplink::Uplink;
use wing_vision::{DetectMode, FrameSource, RawFrame, VisionEngine};

use crate::publisher::{TelemetryPublisher, TelemetryReader};
use crate::queue::BoundedQueue;
use crate::sink::UploadSink;
use crate::supervisor::StageCtx;

/// One frame and the telemetry captured with it. Only the capture stage
/// builds these; the pairing is never redone downstream.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub frame_id: u64,
    pub frame: RawFrame,
    pub snapshot: Arc<TelemetrySnapshot>,
    pub captured: Instant,
    pub captured_unix_ms: i64,
}

pub struct TelemetryStage {
    pub feed: Box<dyn TelemetryFeed>,
    pub publisher: TelemetryPublisher,
    pub sink: UploadSink,
    /// How often a snapshot is queued for upload. `None` disables sampling.
    pub sample_every: Option<Duration>,
    pub last_sample: Option<Instant>,
}

impl TelemetryStage {
    pub fn run(&mut self, ctx: &StageCtx) -> Result<()> {
        while ctx.running() {
            ctx.kick();
            let snap = self.feed.next_snapshot()?;
            match self.publisher.publish(snap) {
                Ok(snap) => self.sample(&snap),
                Err(fault) => self.sink.fault(ctx.name(), &fault),
            }
        }
        Ok(())
    }

    fn sample(&mut self, snap: &TelemetrySnapshot) {
        let Some(every) = self.sample_every else { return };
        let now = Instant::now();
        if self.last_sample.map(|t| now.duration_since(t) >= every).unwrap_or(true) {
            self.last_sample = Some(now);
            self.sink.submit(UploadItem::Telemetry(snap.clone()));
        }
    }
}

pub struct CaptureStage {
    pub source: Box<dyn FrameSource>,
    pub telemetry: TelemetryReader,
    pub frames: Arc<BoundedQueue<FramePacket>>,
    pub sink: UploadSink,
    pub interval: Duration,
    pub next_id: u64,
}

impl CaptureStage {
    /// Attaches the snapshot current at this instant. `None` before the
    /// first snapshot exists.
    pub fn pair(&mut self, frame: RawFrame) -> Option<FramePacket> {
        let captured = Instant::now();
        let snapshot = self.telemetry.latest()?;
        self.next_id += 1;
        Some(FramePacket { frame_id: self.next_id, frame, snapshot, captured, captured_unix_ms: now_unix_ms() })
    }

    pub fn run(&mut self, ctx: &StageCtx) -> Result<()> {
        while ctx.running() {
            ctx.kick();
            let started = Instant::now();
            match self.source.next_frame() {
                Ok(frame) => match self.pair(frame) {
                    Some(packet) => {
                        if let Some(old) = self.frames.put(packet) {
                            debug!("capture: frame {} dropped unprocessed", old.frame_id);
                        }
                    }
                    None => debug!("capture: no telemetry yet, frame discarded"),
                },
                Err(e) => self.sink.fault(ctx.name(), &Fault::TransientIo(format!("{:#}", e))),
            }
            ctx.sleep(self.interval.saturating_sub(started.elapsed()));
        }
        Ok(())
    }
}

pub struct DetectStage {
    pub engine: VisionEngine,
    pub camera: CameraModel,
    pub frames: Arc<BoundedQueue<FramePacket>>,
    pub sink: UploadSink,
    pub poll: Duration,
}

impl DetectStage {
    /// Detects on `packet` and geolocates with the telemetry it carries.
    pub fn process(&mut self, packet: &FramePacket) -> Result<Vec<DetectionResult>> {
        let (mode, dets) = self.engine.process(&packet.frame, packet.captured)?;
        let snap = &packet.snapshot;
        Ok(dets
            .into_iter()
            .map(|d| DetectionResult {
                class_id: d.class_id,
                confidence: d.confidence,
                bbox: d.bbox,
                geo: self.camera.project_bbox(&d.bbox, packet.frame.width, packet.frame.height, snap),
                frame_id: packet.frame_id,
                telemetry_seq: snap.seq,
                ts_unix_ms: packet.captured_unix_ms,
                tracked: mode == DetectMode::Track,
            })
            .collect())
    }

    pub fn run(&mut self, ctx: &StageCtx) -> Result<()> {
        while ctx.running() {
            ctx.kick();
            let Some(packet) = self.frames.get_timeout(self.poll) else {
                continue;
            };
            match self.process(&packet) {
                Ok(results) => {
                    for r in results {
                        let class = self.engine.config().class_name(r.class_id);
                        match Target::from_detection(&r, class) {
                            Some(t) => self.sink.submit(UploadItem::Target(t)),
                            None => debug!("detect: frame {} box has no ground intersection", r.frame_id),
                        }
                    }
                }
                Err(e) => self.sink.error(ctx.name(), &e),
            }
        }
        Ok(())
    }
}

pub struct UploadStage {
    pub uplink: Option<Uplink>,
    pub queue: Arc<BoundedQueue<UploadItem>>,
    pub rt: Handle,
    pub poll: Duration,
}

impl UploadStage {
    pub fn run(&mut self, ctx: &StageCtx) -> Result<()> {
        while ctx.running() {
            ctx.kick();
            let Some(item) = self.queue.get_timeout(self.poll) else {
                continue;
            };
            // already in the audit log; without an uplink there is nothing left to do
            let Some(uplink) = self.uplink.as_mut() else {
                continue;
            };
            // bounded by the uplink timeout; a failure is dropped, never retried here
            if let Err(e) = self.rt.block_on(uplink.offer(&item)) {
                debug!("upload: {} dropped: {:#}", item.label(), e);
            }
        }
        Ok(())
    }
}

pub struct SafetyStage {
    pub monitors: SafetyMonitors,
    pub engine: SafetyDecisionEngine,
    pub gateway: Box<dyn CommandGateway>,
    pub telemetry: TelemetryReader,
    pub sink: UploadSink,
    pub tick: Duration,
}

impl SafetyStage {
    /// One evaluation. Transitions and unresolvable faults are recorded.
    pub fn evaluate(&mut self, snap: &TelemetrySnapshot) -> Decision {
        let inputs = self.monitors.assess(snap);
        let d = self.engine.evaluate(&inputs, self.gateway.as_mut());
        if let Some(t) = &d.transition {
            self.sink.submit(UploadItem::Safety(t.clone()));
        }
        if let Some(f) = &d.fault {
            self.sink.fault("safety", &Fault::Safety(f.clone()));
        }
        d
    }

    pub fn run(&mut self, ctx: &StageCtx) -> Result<()> {
        info!("safety: evaluating every {:?}", self.tick);
        while ctx.running() {
            ctx.kick();
            let started = Instant::now();
            match self.telemetry.latest() {
                Some(snap) => {
                    let aged = aged_links(&snap, now_unix_ms());
                    self.evaluate(&aged);
                }
                None => debug!("safety: waiting for telemetry"),
            }
            ctx.sleep(self.tick.saturating_sub(started.elapsed()));
        }
        Ok(())
    }
}

/// Link ages grow while no new snapshot arrives, so a silent FC link still
/// reads as a lost RC/GCS link.
pub fn aged_links(snap: &TelemetrySnapshot, now_ms: i64) -> TelemetrySnapshot {
    let extra = (now_ms - snap.ts_unix_ms).max(0) as u64;
    let mut s = snap.clone();
    s.links.rc_age_ms = s.links.rc_age_ms.map(|a| a + extra);
    s.links.gcs_age_ms = s.links.gcs_age_ms.map(|a| a + extra);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use wing_proto::telemetry::LinkStatus;

    #[test]
    fn link_ages_keep_growing_without_new_telemetry() {
        let snap = TelemetrySnapshot {
            ts_unix_ms: 10_000,
            links: LinkStatus { rc_present: true, rc_age_ms: Some(100), gcs_present: false, gcs_age_ms: None },
            ..Default::default()
        };
        let aged = aged_links(&snap, 12_500);
        assert_eq!(aged.links.rc_age_ms, Some(2_600));
        assert_eq!(aged.links.gcs_age_ms, None);
        assert_eq!(aged_links(&snap, 9_000).links.rc_age_ms, Some(100));
    }
}
