use std::time::Duration;

use tracing::warn;

pub const NEGOTIATION_TIMEOUT_ENV: &str = "PEERLINK_NEGOTIATION_TIMEOUT_MS";

/// Per-session knobs. The default has no negotiation timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Fails a session that waits this long for the remote's description.
    pub negotiation_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let negotiation_timeout = std::env::var(NEGOTIATION_TIMEOUT_ENV)
            .ok()
            .and_then(|raw| parse_timeout_ms(&raw));
        Self {
            negotiation_timeout,
        }
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }
}

/// `0` and blank disable the timeout; garbage is logged and ignored.
fn parse_timeout_ms(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u64>() {
        Ok(0) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(err) => {
            warn!(
                target = "peerlink::orchestrator",
                value = raw,
                error = %err,
                "ignoring invalid {NEGOTIATION_TIMEOUT_ENV}"
            );
            None
        }
    }
}
