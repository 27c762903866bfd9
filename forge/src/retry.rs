use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and backoff policy applied to failed render attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts before a request is dead-lettered.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

/// Exponential backoff: `min(base * 2^(n-1), max)`, zero for `n == 0`.
pub fn exponential_backoff(n: u32, base_ms: u64, max_ms: u64) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }

    let exp = n.saturating_sub(1).min(62) as i32;
    let scaled = (base_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(max_ms as f64).max(0.0);

    Duration::from_millis(capped as u64)
}

/// Delay before the attempt following `failed_attempts` failures.
pub fn compute_backoff(failed_attempts: u32, config: &RetryConfig) -> Duration {
    exponential_backoff(
        failed_attempts,
        config.base_delay_ms,
        config.max_backoff_ms,
    )
}

/// Returns true when attempts >= max_attempts.
pub fn should_dead_letter(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

/// What to do with a request whose latest attempt failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureDisposition {
    /// Run another attempt after the delay.
    Retry { delay_ms: u64 },
    /// Give up and escalate to the dead-letter sink.
    DeadLetter,
}

/// Decide between another attempt and dead-lettering after
/// `failed_attempts` attempts have failed.
pub fn process_failure(
    failed_attempts: u32,
    config: &RetryConfig,
) -> FailureDisposition {
    if should_dead_letter(failed_attempts, config.max_attempts) {
        FailureDisposition::DeadLetter
    } else {
        let delay = compute_backoff(failed_attempts, config);
        FailureDisposition::Retry {
            delay_ms: delay.as_millis() as u64,
        }
    }
}
