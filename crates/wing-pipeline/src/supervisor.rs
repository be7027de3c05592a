use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use wing_proto::Fault;

use crate::sink::UploadSink;
use crate::watchdog::{Kicker, Watchdog};

/// Why a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Operator asked to stop.
    Shutdown,
    /// A stage raised a fatal fault.
    Fatal(String),
    /// A loop stopped kicking the watchdog.
    Watchdog(String),
}

impl Exit {
    /// Whether the whole pipeline should be started again.
    pub fn restart(&self) -> bool {
        !matches!(self, Exit::Shutdown)
    }
}

/// What a stage loop gets from its supervisor.
pub struct StageCtx {
    name: &'static str,
    stop: Arc<AtomicBool>,
    kicker: Kicker,
}

impl StageCtx {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Checked at every loop iteration boundary.
    pub fn running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    pub fn kick(&self) {
        self.kicker.kick();
    }

    /// Sleeps in short slices, kicking and watching the stop flag.
    pub fn sleep(&self, d: Duration) {
        let deadline = Instant::now() + d;
        while self.running() {
            self.kick();
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

/// Runs each stage on its own named thread. A stage that errors or panics
/// is logged, reported and restarted alone after `backoff`; a fatal fault
/// stops the whole run.
pub struct Supervisor {
    stop: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<Exit>>>,
    watchdog: Arc<Watchdog>,
    sink: UploadSink,
    backoff: Duration,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(watchdog: Arc<Watchdog>, sink: UploadSink, backoff: Duration) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            exit: Arc::new(Mutex::new(None)),
            watchdog,
            sink,
            backoff,
            handles: Vec::new(),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    /// Records why we are stopping (first reason wins) and raises the flag.
    pub fn request_stop(&self, why: Exit) {
        record_exit(&self.exit, &self.stop, why);
    }

    /// Returns a closure that does what `request_stop` does, for threads
    /// that do not own the supervisor.
    pub fn stopper(&self) -> impl Fn(Exit) + Send + Sync + 'static {
        let exit = self.exit.clone();
        let stop = self.stop.clone();
        move |why| record_exit(&exit, &stop, why)
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn spawn<F>(&mut self, name: &'static str, mut body: F) -> Result<()>
    where
        F: FnMut(&StageCtx) -> Result<()> + Send + 'static,
    {
        let ctx = StageCtx { name, stop: self.stop.clone(), kicker: self.watchdog.register(name) };
        let sink = self.sink.clone();
        let backoff = self.backoff;
        let stopper = self.stopper();

        let handle = thread::Builder::new()
            .name(format!("wing-{}", name))
            .spawn(move || {
                info!("{}: started", name);
                while ctx.running() {
                    match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                        Ok(Ok(())) => break,
                        Ok(Err(e)) => {
                            sink.error(name, &e);
                            if e.downcast_ref::<Fault>().map(Fault::is_fatal).unwrap_or(false) {
                                stopper(Exit::Fatal(format!("{}: {:#}", name, e)));
                                break;
                            }
                        }
                        Err(payload) => {
                            let msg = panic_message(payload.as_ref());
                            sink.fault(name, &Fault::TransientIo(format!("stage panicked: {}", msg)));
                        }
                    }
                    if ctx.running() {
                        warn!("{}: restarting in {:?}", name, backoff);
                        ctx.sleep(backoff);
                    }
                }
                info!("{}: stopped", name);
            })
            .with_context(|| format!("spawn {} stage", name))?;
        self.handles.push((name, handle));
        Ok(())
    }

    /// Blocks until a stage or the watchdog stops the run, or `external`
    /// is raised by the operator.
    pub fn wait(&self, external: &AtomicBool, poll: Duration) {
        while !self.stopping() {
            if external.load(Ordering::Relaxed) {
                self.request_stop(Exit::Shutdown);
                break;
            }
            thread::sleep(poll);
        }
    }

    /// Raises the stop flag and joins every stage, giving all of them
    /// together `join_timeout`. Stages still running after that are left
    /// detached; the caller is expected to exit or start over.
    pub fn shutdown(self, join_timeout: Duration) -> Exit {
        self.request_stop(Exit::Shutdown);
        let deadline = Instant::now() + join_timeout;
        let mut pending = self.handles;
        while !pending.is_empty() && Instant::now() < deadline {
            let (done, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(_, h)| h.is_finished());
            for (name, h) in done {
                if h.join().is_err() {
                    error!("{}: thread ended in a panic", name);
                }
            }
            pending = rest;
            if !pending.is_empty() {
                thread::sleep(Duration::from_millis(10));
            }
        }
        for (name, _) in &pending {
            error!("{}: did not stop within {:?}, abandoning it", name, join_timeout);
        }
        let exit = self.exit.lock().unwrap_or_else(|p| p.into_inner()).clone();
        exit.unwrap_or(Exit::Shutdown)
    }
}

fn record_exit(exit: &Mutex<Option<Exit>>, stop: &AtomicBool, why: Exit) {
    let mut slot = exit.lock().unwrap_or_else(|p| p.into_inner());
    if slot.is_none() {
        if why != Exit::Shutdown {
            warn!("pipeline stopping: {:?}", why);
        }
        *slot = Some(why);
    }
    stop.store(true, Ordering::SeqCst);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
