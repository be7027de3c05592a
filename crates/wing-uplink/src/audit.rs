use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::info;
use wing_proto::{now_unix_ms, UploadItem};

/// Append-only JSON-lines record of everything queued for upload, one file
/// per session. Written before the item is queued, so queue eviction and
/// link loss never lose the local copy.
pub struct AuditLog {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl AuditLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("create audit dir {}", dir.display()))?;
        let path = dir.join(format!("session-{}.jsonl", now_unix_ms()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        info!("audit: logging to {}", path.display());
        Ok(Self { path, out: Mutex::new(BufWriter::new(file)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One line per item, flushed before returning.
    pub fn append(&self, item: &UploadItem) -> Result<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        out.write_all(&line).context("audit write")?;
        out.flush().context("audit flush")?;
        Ok(())
    }

    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<UploadItem>> {
        let text = fs::read_to_string(path.as_ref())?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("audit line"))
            .collect()
    }
}
