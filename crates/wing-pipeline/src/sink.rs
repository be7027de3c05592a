use std::sync::Arc;

use tracing::{debug, error, warn};
use wing_proto::upload::FaultReport;
use wing_proto::{now_unix_ms, Fault, FaultKind, UploadItem};
use wing_uplink::AuditLog;

use crate::queue::BoundedQueue;

/// Entry point for everything that leaves the vehicle. Each item is written
/// to the audit log first and only then queued, so an eviction or a dead
/// link never loses the local record.
#[derive(Clone)]
pub struct UploadSink {
    audit: Option<Arc<AuditLog>>,
    queue: Arc<BoundedQueue<UploadItem>>,
}

impl UploadSink {
    pub fn new(audit: Option<Arc<AuditLog>>, queue: Arc<BoundedQueue<UploadItem>>) -> Self {
        Self { audit, queue }
    }

    pub fn queue(&self) -> &Arc<BoundedQueue<UploadItem>> {
        &self.queue
    }

    pub fn submit(&self, item: UploadItem) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&item) {
                error!("audit: {} not recorded: {:#}", item.label(), e);
            }
        }
        if let Some(old) = self.queue.put(item) {
            debug!("{}: full, evicted oldest {}", self.queue.name(), old.label());
        }
    }

    /// Logs a stage fault and records it for the operator.
    pub fn fault(&self, stage: &str, fault: &Fault) {
        match fault.kind() {
            FaultKind::TransientIo | FaultKind::Protocol => warn!("{}: {}", stage, fault),
            _ => error!("{}: {}", stage, fault),
        }
        self.submit(UploadItem::Fault(FaultReport {
            ts_unix_ms: now_unix_ms(),
            stage: stage.to_string(),
            kind: fault.kind(),
            message: fault.to_string(),
        }));
    }

    /// Same as `fault` for plumbing errors: a `Fault` inside is kept as is,
    /// anything else counts as transient I/O.
    pub fn error(&self, stage: &str, err: &anyhow::Error) {
        match err.downcast_ref::<Fault>() {
            Some(f) => self.fault(stage, f),
            None => self.fault(stage, &Fault::TransientIo(format!("{:#}", err))),
        }
    }
}
