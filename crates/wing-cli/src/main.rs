mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wing_fc::mav::FcLink;
use wing_fc::{SafetyDecisionEngine, SafetyMonitors};
use wing_nav::{EnergyBudgetEngine, GeofenceEngine, LinkHealthMonitor};
use wing_pipeline::{PipelineParts, VisionParts};
use wing_proto::GeoPoint;
use wing_uplink::{AuditLog, Uplink};
use wing_vision::{ExternalDetector, SubprocessCamera, VisionEngine};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "wing", version, about = "Flying-wing companion computer: safety monitors, detection and uplink")]
struct Cli {
    #[arg(long)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start every pipeline stage and keep them running.
    Run,
    /// Validate the configuration and list every problem found.
    Doctor,
    Fence {
        #[command(subcommand)]
        cmd: FenceCmd,
    },
}

#[derive(Debug, Subcommand)]
enum FenceCmd {
    /// Evaluate one position against the configured fences.
    Check {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Altitude in metres, same reference as the fence bands.
        #[arg(long, allow_hyphen_values = true)]
        alt: f64,
    },
    /// Write the fence set, templates expanded, as JSON.
    Export { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let cfg = Config::load(&cli.config)?;
    match cli.cmd {
        Command::Run => run(&cfg),
        Command::Doctor => doctor(&cfg),
        Command::Fence { cmd } => fence_cmd(&cfg, cmd),
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    match cfg.validate() {
        Ok(()) => {
            let fences = cfg.fences();
            info!(
                "doctor: OK ({} fence(s), fc {}, detect {}, uplink {})",
                fences.fences.len(),
                on_off(cfg.fc.enable),
                on_off(cfg.detect.enable),
                on_off(cfg.uplink.enable)
            );
            Ok(())
        }
        Err(e) => {
            for v in &e.violations {
                println!("{}", v);
            }
            Err(e.into())
        }
    }
}

fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

fn fence_cmd(cfg: &Config, cmd: FenceCmd) -> Result<()> {
    let fences = cfg.fences();
    wing_nav::doctor::check_geofence(&fences).into_result()?;
    match cmd {
        FenceCmd::Check { lat, lon, alt } => {
            let point = GeoPoint::new(lat, lon);
            anyhow::ensure!(point.is_valid() && alt.is_finite(), "invalid position {}, {} @ {}", lat, lon, alt);
            let check = GeofenceEngine::new(fences).check_position(&point, alt);
            println!("breached={}", check.breached);
            println!("fence={}", check.fence.as_deref().unwrap_or("-"));
            println!("action={:?}", check.action);
            println!("vertical={}", check.vertical);
            println!("clearance_m={:.1}", check.clearance_m);
            if let Some(p) = check.nearest_safe_point {
                println!("safe_point={}", p);
            }
            if !check.near.is_empty() {
                println!("near={}", check.near.join(","));
            }
            Ok(())
        }
        FenceCmd::Export { path } => {
            let json = fences.to_json()?;
            std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
            info!("fence: exported {} fence(s) to {}", fences.fences.len(), path.display());
            Ok(())
        }
    }
}

fn run(cfg: &Config) -> Result<()> {
    cfg.validate()?;
    anyhow::ensure!(cfg.fc.enable, "run needs a flight controller (fc.enable = true)");
    info!("run: starting");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wing-rt")
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("run: interrupt received, stopping");
            flag.store(true, Ordering::SeqCst);
        }
    });

    // one audit file per process, shared by every pipeline restart
    let audit = Arc::new(
        AuditLog::open(&cfg.uplink.audit_dir).with_context(|| format!("open audit log in {}", cfg.uplink.audit_dir))?,
    );
    info!("run: audit log {}", audit.path().display());

    let restart_delay = Duration::from_millis(cfg.pipeline.pipeline_restart_ms);
    let mut attempt = 0u32;
    while !shutdown.load(Ordering::SeqCst) {
        attempt += 1;
        let parts = match build_parts(cfg, &rt, audit.clone()) {
            Ok(p) => p,
            // a bad first start is a setup problem; later ones are retried
            Err(e) if attempt == 1 => return Err(e),
            Err(e) => {
                error!("run: restart {} failed: {:#}", attempt, e);
                pause(&shutdown, restart_delay);
                continue;
            }
        };
        let exit = wing_pipeline::run(&cfg.pipeline, parts, &shutdown, rt.handle().clone())?;
        if !exit.restart() {
            break;
        }
        warn!("run: pipeline ended ({:?}), restarting in {:?}", exit, restart_delay);
        pause(&shutdown, restart_delay);
    }

    rt.shutdown_timeout(Duration::from_secs(1));
    info!("run: stopped");
    Ok(())
}

fn pause(shutdown: &AtomicBool, d: Duration) {
    let deadline = Instant::now() + d;
    while !shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn build_parts(cfg: &Config, rt: &Runtime, audit: Arc<AuditLog>) -> Result<PipelineParts> {
    // the serial probe and the async camera need a reactor
    let _guard = rt.enter();

    let (link, reader) = FcLink::open(&cfg.fc).context("FC open")?;

    let home = cfg.home();
    let monitors = SafetyMonitors {
        geofence: GeofenceEngine::new(cfg.fences()),
        energy: EnergyBudgetEngine::new(cfg.energy.clone(), home),
        link: LinkHealthMonitor::new(cfg.link.clone(), home),
    };
    let safety = SafetyDecisionEngine::new(cfg.safety.clone(), cfg.energy.warn_margin_pct, cfg.energy.critical_margin_pct);

    let vision = if cfg.detect.enable {
        let detector = ExternalDetector::new(cfg.detect.command.clone()).context("start detector")?;
        Some(VisionParts {
            source: Box::new(SubprocessCamera::new(cfg.camera.clone(), rt.handle().clone())),
            engine: VisionEngine::new(Box::new(detector), cfg.detect.clone()),
            camera: cfg.camera_model.clone(),
            frame_interval: cfg.camera.frame_interval(),
        })
    } else {
        None
    };

    let uplink = if cfg.uplink.enable { Some(Uplink::new(&cfg.uplink)?) } else { None };

    Ok(PipelineParts {
        telemetry: Box::new(reader),
        gateway: Box::new(link),
        monitors,
        safety,
        safety_tick: Duration::from_millis(cfg.safety.tick_ms),
        vision,
        uplink,
        audit: Some(audit),
    })
}
