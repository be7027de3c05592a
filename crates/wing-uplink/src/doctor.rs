use std::path::Path;

use wing_proto::ConfigError;

use crate::{Endpoint, UplinkConfig};

pub fn check_uplink(cfg: &UplinkConfig) -> ConfigError {
    let mut e = ConfigError::default();
    let p = Path::new(&cfg.audit_dir);
    e.check(!cfg.audit_dir.is_empty(), "uplink.audit_dir must be set");
    if p.exists() {
        e.check(p.is_dir(), format!("uplink.audit_dir is not a dir: {}", cfg.audit_dir));
    }
    if !cfg.enable {
        return e;
    }
    if let Err(err) = Endpoint::parse(&cfg.endpoint) {
        e.push(format!("uplink.endpoint: {:#}", err));
    }
    e.check(cfg.timeout_ms > 0 && cfg.timeout_ms <= 30_000, "uplink.timeout_ms should be 1..30000");
    e.check(cfg.max_backoff_ms >= cfg.timeout_ms, "uplink.max_backoff_ms must be >= timeout_ms");
    e
}
