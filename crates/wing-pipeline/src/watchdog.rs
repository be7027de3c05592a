use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::error;

struct Slot {
    name: &'static str,
    /// Nanoseconds since `origin` at the last kick.
    last_kick: AtomicU64,
}

/// Liveness timer shared by every stage loop. Each loop holds a `Kicker`;
/// the watchdog expires when any loop has gone `timeout` without kicking.
/// Expiry fires once per watchdog lifetime.
pub struct Watchdog {
    timeout: Duration,
    origin: Instant,
    slots: Mutex<Vec<Arc<Slot>>>,
    fired: AtomicBool,
}

/// A loop's handle to kick the watchdog.
#[derive(Clone)]
pub struct Kicker {
    slot: Arc<Slot>,
    origin: Instant,
}

impl Kicker {
    pub fn kick(&self) {
        self.kick_at(Instant::now());
    }

    pub fn kick_at(&self, now: Instant) {
        let ns = now.saturating_duration_since(self.origin).as_nanos() as u64;
        self.slot.last_kick.store(ns, Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.slot.name
    }
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, origin: Instant::now(), slots: Mutex::new(Vec::new()), fired: AtomicBool::new(false) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a monitored loop. Registration counts as its first kick.
    pub fn register(&self, name: &'static str) -> Kicker {
        let slot = Arc::new(Slot { name, last_kick: AtomicU64::new(0) });
        let kicker = Kicker { slot: slot.clone(), origin: self.origin };
        kicker.kick();
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).push(slot);
        kicker
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Name of the first stalled loop, at most once.
    pub fn check_at(&self, now: Instant) -> Option<&'static str> {
        if self.has_fired() {
            return None;
        }
        let now_ns = now.saturating_duration_since(self.origin).as_nanos() as u64;
        let limit = self.timeout.as_nanos() as u64;
        let stalled = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots
                .iter()
                .find(|s| now_ns.saturating_sub(s.last_kick.load(Ordering::Relaxed)) > limit)
                .map(|s| s.name)
        }?;
        // only the first caller wins
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(stalled)
    }

    /// Polls on its own thread until `stop` is set or the watchdog fires,
    /// then calls `on_expire` with the stalled loop's name.
    pub fn spawn<F>(self: &Arc<Self>, stop: Arc<AtomicBool>, on_expire: F) -> Result<thread::JoinHandle<()>>
    where
        F: FnOnce(&'static str) + Send + 'static,
    {
        let wd = self.clone();
        let poll = (self.timeout / 4).clamp(Duration::from_millis(10), Duration::from_millis(500));
        thread::Builder::new()
            .name("wing-watchdog".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(poll);
                    if let Some(stage) = wd.check_at(Instant::now()) {
                        error!("watchdog: {} silent for more than {:?}, restarting pipeline", stage, wd.timeout);
                        on_expire(stage);
                        break;
                    }
                }
            })
            .context("spawn watchdog thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn withheld_kicks_fire_recovery_exactly_once() {
        let wd = Watchdog::new(Duration::from_secs(5));
        let capture = wd.register("capture");
        let safety = wd.register("safety");
        let t0 = wd.origin;
        capture.kick_at(t0);
        safety.kick_at(t0);

        // kicks withheld for 6 s, checked every 100 ms
        let fires: Vec<_> = (1..=60).filter_map(|i| wd.check_at(t0 + Duration::from_millis(100 * i))).collect();
        assert_eq!(fires.len(), 1);
        assert!(wd.has_fired());

        // a late kick does not re-arm it
        capture.kick_at(t0 + Duration::from_secs(7));
        assert_eq!(wd.check_at(t0 + Duration::from_secs(20)), None);
    }

    #[test]
    fn regular_kicks_keep_it_quiet() {
        let wd = Watchdog::new(Duration::from_secs(5));
        let k = wd.register("detect");
        let t0 = wd.origin;
        for s in 0..30 {
            let now = t0 + Duration::from_secs(s);
            k.kick_at(now);
            assert_eq!(wd.check_at(now + Duration::from_millis(900)), None);
        }
        assert!(!wd.has_fired());
    }

    #[test]
    fn one_stalled_loop_is_enough() {
        let wd = Watchdog::new(Duration::from_secs(5));
        let busy = wd.register("safety");
        let _stuck = wd.register("upload");
        let t0 = wd.origin;
        busy.kick_at(t0 + Duration::from_secs(5));
        assert_eq!(wd.check_at(t0 + Duration::from_millis(5_500)), Some("upload"));
    }

    #[test]
    fn background_thread_calls_recovery_once() {
        let wd = Arc::new(Watchdog::new(Duration::from_millis(100)));
        let _k = wd.register("capture");
        let stop = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let h = wd
            .spawn(stop.clone(), move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(400));
        stop.store(true, Ordering::SeqCst);
        h.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
