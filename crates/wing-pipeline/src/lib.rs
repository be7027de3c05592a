//! Stage wiring for one run of the companion pipeline.
//!
//! ```text
//! telemetry ─► publisher ─┬─► capture ─► [frames] ─► detect ─┐
//!                         └─► safety ─► gateway              ├─► sink ─► [uploads] ─► upload
//!                                       faults, transitions ─┘
//! ```
//!
//! Every stage owns a dedicated thread; the only shared state is the two
//! queues and the telemetry publisher.

pub mod publisher;
pub mod queue;
pub mod sink;
pub mod stages;
pub mod supervisor;
pub mod watchdog;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::info;
use wing_fc::{CommandGateway, SafetyDecisionEngine, SafetyMonitors, TelemetryFeed};
use wing_nav::CameraModel;
use wing_proto::ConfigError;
use wing_uplink::{AuditLog, Uplink};
use wing_vision::{FrameSource, VisionEngine};

pub use publisher::{TelemetryPublisher, TelemetryReader};
pub use queue::BoundedQueue;
pub use sink::UploadSink;
pub use stages::FramePacket;
pub use supervisor::{Exit, StageCtx, Supervisor};
pub use watchdog::{Kicker, Watchdog};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_queue: usize,
    pub upload_queue: usize,
    pub watchdog_timeout_s: u64,
    /// Total time granted to all stages to stop.
    pub join_timeout_ms: u64,
    /// Pause before a failed stage is started again.
    pub restart_backoff_ms: u64,
    /// Pause before the whole pipeline is started again.
    pub pipeline_restart_ms: u64,
    /// Telemetry upload rate; 0 disables telemetry upload.
    pub telemetry_upload_ms: u64,
    /// Longest a consumer waits on its queue before looking at the stop flag.
    pub queue_poll_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue: 2,
            upload_queue: 50,
            watchdog_timeout_s: 60,
            join_timeout_ms: 2_000,
            restart_backoff_ms: 1_000,
            pipeline_restart_ms: 3_000,
            telemetry_upload_ms: 1_000,
            queue_poll_ms: 200,
        }
    }
}

impl PipelineConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_s)
    }

    pub fn check(&self) -> ConfigError {
        let mut e = ConfigError::default();
        e.check(self.frame_queue >= 1, "pipeline.frame_queue must be >= 1");
        e.check(self.upload_queue >= 1, "pipeline.upload_queue must be >= 1");
        e.check(self.watchdog_timeout_s >= 2, "pipeline.watchdog_timeout_s must be >= 2");
        e.check(self.join_timeout_ms > 0, "pipeline.join_timeout_ms must be > 0");
        // no single wait may eat half the watchdog budget
        let half_ms = self.watchdog_timeout_s * 500;
        e.check(self.queue_poll_ms > 0 && self.queue_poll_ms < half_ms, "pipeline.queue_poll_ms must be below half the watchdog timeout");
        e.check(self.restart_backoff_ms < half_ms, "pipeline.restart_backoff_ms must be below half the watchdog timeout");
        e
    }
}

/// Everything a run needs, already opened by the caller.
pub struct PipelineParts {
    pub telemetry: Box<dyn TelemetryFeed>,
    pub gateway: Box<dyn CommandGateway>,
    pub monitors: SafetyMonitors,
    pub safety: SafetyDecisionEngine,
    pub safety_tick: Duration,
    /// Camera and detector; `None` runs safety only.
    pub vision: Option<VisionParts>,
    pub uplink: Option<Uplink>,
    pub audit: Option<Arc<AuditLog>>,
}

pub struct VisionParts {
    pub source: Box<dyn FrameSource>,
    pub engine: VisionEngine,
    pub camera: CameraModel,
    pub frame_interval: Duration,
}

/// Starts every stage and blocks until the operator raises `shutdown`, a
/// stage fails fatally, or the watchdog expires. Stages are then stopped
/// and joined within `join_timeout_ms`.
pub fn run(cfg: &PipelineConfig, parts: PipelineParts, shutdown: &AtomicBool, rt: Handle) -> Result<Exit> {
    let poll = Duration::from_millis(cfg.queue_poll_ms.max(1));
    let uploads = Arc::new(BoundedQueue::new("uploads", cfg.upload_queue));
    let sink = UploadSink::new(parts.audit, uploads.clone());
    let watchdog = Arc::new(Watchdog::new(cfg.watchdog_timeout()));
    let mut sup = Supervisor::new(watchdog.clone(), sink.clone(), Duration::from_millis(cfg.restart_backoff_ms));

    let (publisher, reader) = TelemetryPublisher::new();
    let mut telemetry = stages::TelemetryStage {
        feed: parts.telemetry,
        publisher,
        sink: sink.clone(),
        sample_every: (cfg.telemetry_upload_ms > 0).then(|| Duration::from_millis(cfg.telemetry_upload_ms)),
        last_sample: None,
    };
    sup.spawn("telemetry", move |ctx| telemetry.run(ctx))?;

    let mut safety = stages::SafetyStage {
        monitors: parts.monitors,
        engine: parts.safety,
        gateway: parts.gateway,
        telemetry: reader.clone(),
        sink: sink.clone(),
        tick: parts.safety_tick,
    };
    sup.spawn("safety", move |ctx| safety.run(ctx))?;

    if let Some(vision) = parts.vision {
        let frames = Arc::new(BoundedQueue::new("frames", cfg.frame_queue));
        let mut capture = stages::CaptureStage {
            source: vision.source,
            telemetry: reader,
            frames: frames.clone(),
            sink: sink.clone(),
            interval: vision.frame_interval,
            next_id: 0,
        };
        sup.spawn("capture", move |ctx| capture.run(ctx))?;

        let mut detect = stages::DetectStage {
            engine: vision.engine,
            camera: vision.camera,
            frames,
            sink: sink.clone(),
            poll,
        };
        sup.spawn("detect", move |ctx| detect.run(ctx))?;
    } else {
        info!("pipeline: vision disabled, running safety only");
    }

    let mut upload = stages::UploadStage { uplink: parts.uplink, queue: uploads, rt, poll };
    sup.spawn("upload", move |ctx| upload.run(ctx))?;

    let stopper = sup.stopper();
    let wd_thread = watchdog.spawn(sup.stop_flag(), move |stage| stopper(Exit::Watchdog(stage.to_string())))?;

    info!("pipeline: running (watchdog {:?})", cfg.watchdog_timeout());
    sup.wait(shutdown, Duration::from_millis(50));
    let exit = sup.shutdown(Duration::from_millis(cfg.join_timeout_ms));
    // the watchdog sees the stop flag within one poll
    let _ = wd_thread.join();
    info!("pipeline: stopped ({:?})", exit);
    Ok(exit)
}
