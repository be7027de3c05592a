pub mod audit;
pub mod doctor;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use wing_proto::UploadItem;

pub use audit::AuditLog;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub enable: bool,
    /// tcp://host:port or tls://host:port
    pub endpoint: String,
    /// Upper bound for one send, connect included.
    pub timeout_ms: u64,
    /// Ceiling for the pause after repeated failures.
    pub max_backoff_ms: u64,
    /// Session audit logs (JSON lines) go here.
    pub audit_dir: String,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            enable: true,
            endpoint: "tcp://127.0.0.1:7700".into(),
            timeout_ms: 3_000,
            max_backoff_ms: 30_000,
            audit_dir: "/var/lib/wing/audit".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(r) = s.strip_prefix("tls://") {
            (Scheme::Tls, r)
        } else if let Some(r) = s.strip_prefix("tcp://") {
            (Scheme::Tcp, r)
        } else {
            anyhow::bail!("endpoint must start with tcp:// or tls://: {}", s);
        };
        let (host, port) = rest.rsplit_once(':').context("endpoint missing port")?;
        anyhow::ensure!(!host.is_empty(), "endpoint missing host");
        let port = port.parse::<u16>().with_context(|| format!("bad endpoint port '{}'", port))?;
        Ok(Self { scheme, host: host.to_string(), port })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct UplinkHealth {
    pub rtt_ms: Option<u32>,
    pub quality: u8, // 0-100
    pub consecutive_failures: u32,
    pub sent: u64,
    pub skipped: u64,
    last_failure: Option<Instant>,
}

impl Default for UplinkHealth {
    fn default() -> Self {
        Self { rtt_ms: None, quality: 100, consecutive_failures: 0, sent: 0, skipped: 0, last_failure: None }
    }
}

/// Best-effort sender. Every call is bounded by the configured timeout and
/// a failure is never retried here; the audit log already has the item.
pub struct Uplink {
    endpoint: Endpoint,
    timeout: Duration,
    max_backoff: Duration,
    tls: Option<TlsConnector>,
    health: UplinkHealth,
}

impl Uplink {
    pub fn new(cfg: &UplinkConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(&cfg.endpoint)?;
        let tls = match endpoint.scheme {
            Scheme::Tls => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let tls_cfg = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
                Some(TlsConnector::from(Arc::new(tls_cfg)))
            }
            Scheme::Tcp => {
                warn!("uplink: plain tcp to {} (no TLS)", endpoint.addr());
                None
            }
        };
        info!("uplink: endpoint {} (timeout {}ms)", cfg.endpoint, cfg.timeout_ms);
        Ok(Self {
            endpoint,
            timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            tls,
            health: UplinkHealth::default(),
        })
    }

    pub fn health(&self) -> &UplinkHealth {
        &self.health
    }

    /// Pause after consecutive failures: timeout doubled per failure, capped.
    pub fn backoff(&self) -> Duration {
        match self.health.consecutive_failures {
            0 => Duration::ZERO,
            n => (self.timeout * (1u32 << n.min(5))).min(self.max_backoff),
        }
    }

    /// False while backing off from a failed link. Callers drop the item
    /// instead of waiting.
    pub fn ready(&self, now: Instant) -> bool {
        match self.health.last_failure {
            Some(t) => now.saturating_duration_since(t) >= self.backoff(),
            None => true,
        }
    }

    /// Sends when the link is not backing off. Returns whether it was sent.
    pub async fn offer(&mut self, item: &UploadItem) -> Result<bool> {
        if !self.ready(Instant::now()) {
            self.health.skipped += 1;
            debug!("uplink: backing off, {} not sent", item.label());
            return Ok(false);
        }
        self.send(item).await?;
        Ok(true)
    }

    pub async fn send(&mut self, item: &UploadItem) -> Result<()> {
        let frame = encode_frame(item)?;
        let start = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.send_frame(&frame)).await {
            Ok(r) => r,
            Err(_) => Err(anyhow::anyhow!("send timed out after {:?}", self.timeout)),
        };

        match result {
            Ok(()) => {
                let rtt = start.elapsed().as_millis() as u32;
                let h = &mut self.health;
                h.rtt_ms = Some(rtt);
                h.consecutive_failures = 0;
                h.last_failure = None;
                h.sent += 1;
                h.quality = h.quality.saturating_add(10).min(100);
                debug!("uplink: sent {} ({} bytes, {}ms, quality {}%)", item.label(), frame.len(), rtt, h.quality);
                Ok(())
            }
            Err(e) => {
                let h = &mut self.health;
                h.consecutive_failures += 1;
                h.last_failure = Some(Instant::now());
                h.quality = h.quality.saturating_sub(20);
                warn!(
                    "uplink: send failed (failures: {}, quality: {}%): {:#}",
                    h.consecutive_failures, h.quality, e
                );
                Err(e)
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let tcp = TcpStream::connect(self.endpoint.addr())
            .await
            .with_context(|| format!("connect {}", self.endpoint.addr()))?;
        tcp.set_nodelay(true).ok();
        match &self.tls {
            Some(tls) => {
                let name = ServerName::try_from(self.endpoint.host.clone()).context("tls server name")?;
                let mut stream = tls.connect(name, tcp).await.context("tls handshake")?;
                write_frame(&mut stream, frame).await?;
                stream.shutdown().await.ok();
            }
            None => {
                let mut stream = tcp;
                write_frame(&mut stream, frame).await?;
                stream.shutdown().await.ok();
            }
        }
        Ok(())
    }
}

/// u32 big-endian length followed by the JSON document.
pub fn encode_frame(item: &UploadItem) -> Result<BytesMut> {
    let payload = serde_json::to_vec(item)?;
    let len = u32::try_from(payload.len()).context("upload item too large")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(len);
    buf.put_slice(&payload);
    Ok(buf)
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> Result<()> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wing_proto::upload::FaultReport;
    use wing_proto::FaultKind;

    fn item() -> UploadItem {
        UploadItem::Fault(FaultReport {
            ts_unix_ms: 1_700_000_000_000,
            stage: "capture".into(),
            kind: FaultKind::TransientIo,
            message: "camera timeout".into(),
        })
    }

    fn cfg(endpoint: String, timeout_ms: u64) -> UplinkConfig {
        UplinkConfig { endpoint, timeout_ms, ..Default::default() }
    }

    #[test]
    fn endpoint_parsing() {
        let ep = Endpoint::parse("tls://ground.example.net:7443").unwrap();
        assert_eq!(ep.scheme, Scheme::Tls);
        assert_eq!(ep.addr(), "ground.example.net:7443");
        assert_eq!(Endpoint::parse("tcp://10.0.0.2:7700").unwrap().scheme, Scheme::Tcp);
        assert!(Endpoint::parse("http://x:1").is_err());
        assert!(Endpoint::parse("tcp://x").is_err());
        assert!(Endpoint::parse("tcp://:80").is_err());
        assert!(Endpoint::parse("tcp://x:99999").is_err());
    }

    #[test]
    fn frame_is_length_prefixed_json() {
        let f = encode_frame(&item()).unwrap();
        let len = u32::from_be_bytes([f[0], f[1], f[2], f[3]]) as usize;
        assert_eq!(len, f.len() - 4);
        let back: UploadItem = serde_json::from_slice(&f[4..]).unwrap();
        assert_eq!(back, item());
    }

    #[tokio::test]
    async fn delivers_one_frame_per_item() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let len = sock.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            sock.read_exact(&mut body).await.unwrap();
            serde_json::from_slice::<UploadItem>(&body).unwrap()
        });

        let mut up = Uplink::new(&cfg(format!("tcp://{}", addr), 1_000)).unwrap();
        up.send(&item()).await.unwrap();
        assert_eq!(server.await.unwrap(), item());
        assert_eq!(up.health().sent, 1);
        assert!(up.health().rtt_ms.is_some());
    }

    #[tokio::test]
    async fn refused_connection_degrades_health_and_backs_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut up = Uplink::new(&cfg(format!("tcp://{}", addr), 500)).unwrap();
        assert!(up.send(&item()).await.is_err());
        assert_eq!(up.health().consecutive_failures, 1);
        assert_eq!(up.health().quality, 80);
        assert_eq!(up.backoff(), Duration::from_millis(1_000));
        assert!(!up.ready(Instant::now()));

        // skipped without touching the network
        assert!(!up.offer(&item()).await.unwrap());
        assert_eq!(up.health().skipped, 1);
    }

    #[tokio::test]
    async fn stalled_peer_is_cut_off_by_the_timeout() {
        // accepts but never speaks TLS, so the handshake hangs
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(sock);
        });

        let mut up = Uplink::new(&cfg(format!("tls://{}", addr), 200)).unwrap();
        let start = Instant::now();
        let err = up.send(&item()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn backoff_is_capped() {
        let mut up = Uplink::new(&cfg("tcp://127.0.0.1:9".into(), 3_000)).unwrap();
        up.health.consecutive_failures = 10;
        assert_eq!(up.backoff(), Duration::from_millis(30_000));
    }
}
