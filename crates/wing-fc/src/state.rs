use std::time::{Duration, Instant};

/// Link bookkeeping shared between the reader and the command side.
#[derive(Debug, Clone, Default)]
pub struct FcStatus {
    pub connected: bool,
    pub endpoint: Option<String>,
    pub last_heartbeat: Option<Instant>,
    pub messages: u64,
    pub recv_errors: u64,
    pub last_msg: Option<&'static str>,
}

impl FcStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// FC heartbeat seen within `within`.
    pub fn alive(&self, within: Duration) -> bool {
        self.hb_age().map(|a| a <= within).unwrap_or(false)
    }
}
