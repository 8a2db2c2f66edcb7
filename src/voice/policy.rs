//! Reconnect backoff and outage handling for provider sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling for any reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Linear backoff: `base * attempt`, capped at `max` (itself capped at 30s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: u64::try_from(base.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms).min(MAX_RECONNECT_DELAY);
        let linear = self
            .base_delay_ms
            .saturating_mul(u64::from(attempt.max(1)));
        Duration::from_millis(linear).min(cap)
    }
}

/// What happens to outbound audio while the session is not `Ready`
/// (before the first handshake completes, and during reconnect windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutagePolicy {
    /// Warn and drop. The provider has no replay across sessions.
    #[default]
    Drop,
    /// Hold up to N chunks (oldest kept) and flush them in order on the
    /// next `Ready`.
    Buffer(usize),
}

impl OutagePolicy {
    pub fn capacity(self) -> usize {
        match self {
            Self::Drop => 0,
            Self::Buffer(n) => n,
        }
    }
}
