//! Detector hosted in a separate process.
//!
//! Per frame we write one JSON header line `{"width":W,"height":H,"len":N}`
//! followed by the N encoded bytes to the child's stdin, and read back one
//! line holding a JSON array of `{"class_id","confidence","bbox"}` objects.
//! The model runtime stays out of this process entirely.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::{Detection, Detector, RawFrame};

#[derive(Serialize)]
struct FrameHeader {
    width: u32,
    height: u32,
    len: usize,
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct ExternalDetector {
    argv: Vec<String>,
    session: Option<Session>,
    line: String,
}

impl ExternalDetector {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        anyhow::ensure!(!argv.is_empty(), "detector command is empty");
        Ok(Self { argv, session: None, line: String::new() })
    }

    fn spawn(&self) -> Result<Session> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn detector {}", self.argv[0]))?;
        let stdin = child.stdin.take().context("detector stdin")?;
        let stdout = child.stdout.take().context("detector stdout")?;
        info!("detector: started {} (pid {})", self.argv[0], child.id());
        Ok(Session { child, stdin, stdout: BufReader::new(stdout) })
    }

    fn exchange(session: &mut Session, frame: &RawFrame, line: &mut String) -> Result<Vec<Detection>> {
        let header = FrameHeader { width: frame.width, height: frame.height, len: frame.data.len() };
        serde_json::to_writer(&mut session.stdin, &header)?;
        session.stdin.write_all(b"\n")?;
        session.stdin.write_all(&frame.data)?;
        session.stdin.flush()?;

        line.clear();
        let n = session.stdout.read_line(line).context("read detector reply")?;
        anyhow::ensure!(n > 0, "detector closed its output");
        let dets: Vec<Detection> = serde_json::from_str(line.trim()).context("parse detector reply")?;
        Ok(dets)
    }
}

impl Detector for ExternalDetector {
    fn detect(&mut self, frame: &RawFrame) -> Result<Vec<Detection>> {
        if self.session.is_none() {
            self.session = Some(self.spawn()?);
        }
        let Some(session) = self.session.as_mut() else {
            anyhow::bail!("detector not running");
        };
        match Self::exchange(session, frame, &mut self.line) {
            Ok(dets) => Ok(dets),
            Err(e) => {
                // respawn on the next frame
                if let Some(mut s) = self.session.take() {
                    let _ = s.child.kill();
                    let _ = s.child.wait();
                }
                warn!("detector: session dropped: {:#}", e);
                Err(e)
            }
        }
    }
}

impl Drop for ExternalDetector {
    fn drop(&mut self) {
        if let Some(mut s) = self.session.take() {
            let _ = s.child.kill();
            let _ = s.child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn frame() -> RawFrame {
        RawFrame::new(vec![0u8; 16], 640, 480)
    }

    #[test]
    fn reads_one_reply_line_per_frame() {
        // consume the header line, reply, and let the 16 payload bytes sit in the pipe
        let script = r#"read h; echo '[{"class_id":0,"confidence":0.8,"bbox":{"x1":1,"y1":2,"x2":3,"y2":4}}]'; sleep 1"#;
        let mut det = ExternalDetector::new(vec!["sh".into(), "-c".into(), script.into()]).unwrap();
        let out = det.detect(&frame()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 0);
        assert_eq!(out[0].bbox.x2, 3.0);
    }

    #[test]
    fn dead_detector_is_an_error_not_a_panic() {
        let mut det = ExternalDetector::new(vec!["sh".into(), "-c".into(), "exit 0".into()]).unwrap();
        assert!(det.detect(&frame()).is_err());
        assert!(det.session.is_none());
    }

    #[test]
    fn empty_command_rejected() {
        assert!(ExternalDetector::new(vec![]).is_err());
    }
}
