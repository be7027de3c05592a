use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;
use wing_proto::{Fault, TelemetrySnapshot};

/// Single writer of the current vehicle state. Readers always get a whole
/// snapshot, never a half-updated one.
pub struct TelemetryPublisher {
    tx: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
    last_good: Option<Arc<TelemetrySnapshot>>,
    rejected: u64,
}

/// Cheap, cloneable read handle.
#[derive(Clone)]
pub struct TelemetryReader {
    rx: watch::Receiver<Option<Arc<TelemetrySnapshot>>>,
}

impl TelemetryPublisher {
    pub fn new() -> (Self, TelemetryReader) {
        let (tx, rx) = watch::channel(None);
        (Self { tx, last_good: None, rejected: 0 }, TelemetryReader { rx })
    }

    pub fn subscribe(&self) -> TelemetryReader {
        TelemetryReader { rx: self.tx.subscribe() }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Publishes `snap` when it validates. A malformed snapshot is dropped
    /// and the last good one is republished flagged `stale`.
    pub fn publish(&mut self, snap: TelemetrySnapshot) -> Result<Arc<TelemetrySnapshot>, Fault> {
        match snap.validate() {
            Ok(()) => {
                let snap = Arc::new(snap);
                self.last_good = Some(snap.clone());
                self.tx.send_replace(Some(snap.clone()));
                Ok(snap)
            }
            Err(fault) => {
                self.rejected += 1;
                warn!("telemetry: seq {} discarded: {}", snap.seq, fault);
                if let Some(good) = &self.last_good {
                    let stale = TelemetrySnapshot { stale: true, ..(**good).clone() };
                    self.tx.send_replace(Some(Arc::new(stale)));
                }
                Err(fault)
            }
        }
    }
}

impl TelemetryReader {
    /// `None` until the first valid snapshot arrives.
    pub fn latest(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.rx.borrow().clone()
    }
}
