use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::debug;
use wing_proto::ConfigError;

use crate::RawFrame;

/// Blocking frame supplier. Called from the capture stage only.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<RawFrame>;
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn next_frame(&mut self) -> Result<RawFrame> {
        (**self).next_frame()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub mode: String,   // "libcamera-jpeg" | "v4l2-mjpeg"
    pub device: String, // /dev/video0 (v4l2)
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// A capture slower than this is a transient failure.
    pub capture_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: "libcamera-jpeg".into(),
            device: "/dev/video0".into(),
            width: 1280,
            height: 720,
            fps: 5,
            capture_timeout_ms: 2_000,
        }
    }
}

impl CameraConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }

    pub fn check(&self) -> ConfigError {
        let mut e = ConfigError::default();
        e.check(
            matches!(self.mode.as_str(), "libcamera-jpeg" | "v4l2-mjpeg"),
            format!("camera.mode '{}' should be libcamera-jpeg or v4l2-mjpeg", self.mode),
        );
        e.check(self.width >= 64 && self.height >= 64, "camera resolution too small");
        e.check(self.fps >= 1 && self.fps <= 30, "camera.fps should be 1..30");
        e.check(self.capture_timeout_ms > 0, "camera.capture_timeout_ms must be > 0");
        e
    }
}

/// Grabs single JPEG frames through a helper process:
/// - libcamera-jpeg: `libcamera-still -n -t 1 --width ... --height ... -o -`
/// - v4l2-mjpeg: one MJPEG frame through `ffmpeg`
///
/// Runs the async capture on the shared runtime so every grab is bounded by
/// `capture_timeout_ms`.
pub struct SubprocessCamera {
    cfg: CameraConfig,
    rt: Handle,
}

impl SubprocessCamera {
    pub fn new(cfg: CameraConfig, rt: Handle) -> Self {
        Self { cfg, rt }
    }
}

impl FrameSource for SubprocessCamera {
    fn next_frame(&mut self) -> Result<RawFrame> {
        let limit = Duration::from_millis(self.cfg.capture_timeout_ms);
        let cfg = &self.cfg;
        let jpeg = self
            .rt
            .block_on(async { tokio::time::timeout(limit, capture_jpeg(cfg)).await })
            .with_context(|| format!("capture timed out after {:?}", limit))??;
        let (width, height) = probe_dimensions(&jpeg)?;
        Ok(RawFrame::new(jpeg, width, height))
    }
}

/// Reads the header only; the pixels are decoded by the detector.
pub fn probe_dimensions(encoded: &[u8]) -> Result<(u32, u32)> {
    anyhow::ensure!(!encoded.is_empty(), "empty frame");
    let dims = image::ImageReader::new(Cursor::new(encoded))
        .with_guessed_format()
        .context("frame format")?
        .into_dimensions()
        .context("frame header")?;
    Ok(dims)
}

pub async fn capture_jpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    match cfg.mode.as_str() {
        "libcamera-jpeg" => capture_libcamera(cfg).await,
        "v4l2-mjpeg" => capture_v4l2_ffmpeg(cfg).await,
        other => anyhow::bail!("unknown camera.mode: {}", other),
    }
}

async fn capture_libcamera(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("libcamera-still");
    cmd.args([
        "-n",
        "-t", "1",
        "--width", &cfg.width.to_string(),
        "--height", &cfg.height.to_string(),
        "-o", "-",
    ]);
    cmd.kill_on_drop(true);

    debug!("capture: libcamera-still");
    let out = cmd.output().await.context("run libcamera-still")?;
    anyhow::ensure!(out.status.success(), "libcamera-still exited with {}", out.status);
    Ok(out.stdout)
}

async fn capture_v4l2_ffmpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-hide_banner", "-loglevel", "error",
        "-f", "video4linux2",
        "-input_format", "mjpeg",
        "-video_size", &format!("{}x{}", cfg.width, cfg.height),
        "-i", &cfg.device,
        "-vframes", "1",
        "-f", "image2pipe",
        "-vcodec", "mjpeg",
        "-",
    ]);
    cmd.kill_on_drop(true);

    debug!("capture: ffmpeg v4l2 {}", cfg.device);
    let out = cmd.output().await.context("run ffmpeg capture")?;
    anyhow::ensure!(out.status.success(), "ffmpeg capture exited with {}", out.status);
    Ok(out.stdout)
}
