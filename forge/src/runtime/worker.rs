use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Polling behavior of the render state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Wait between two status polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive transient poll errors tolerated before the attempt fails.
    pub poll_retry_ceiling: u32,
    /// Base backoff after a transient poll error, in milliseconds.
    pub poll_backoff_ms: u64,
    /// Upper bound of the transient poll backoff, in milliseconds.
    pub max_poll_backoff_ms: u64,
}

impl RenderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_poll_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.poll_retry_ceiling = ceiling;
        self
    }

    /// Set the transient poll backoff and its cap.
    pub fn with_poll_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.poll_backoff_ms = base_ms;
        self.max_poll_backoff_ms = max_ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            poll_retry_ceiling: 5,
            poll_backoff_ms: 1_000,
            max_poll_backoff_ms: 60_000,
        }
    }
}
