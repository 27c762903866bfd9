//! Scripted collaborators and fixtures for exercising the forge runtime
//! without external services.

mod reader;
mod render;
mod report;

pub use reader::{grid, row, rows, StaticRowReader};
pub use render::{PollStep, ScriptedAttempt, ScriptedRenderClient, SubmitStep};
pub use report::RecordingReportSink;

use forge::{AppConfig, RenderConfig, RetryConfig};

/// Configuration with fast polling and retries, suited to tests.
pub fn fast_config(concurrency: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.concurrency.limit = concurrency;
    config.render = RenderConfig::new()
        .with_poll_interval(10)
        .with_poll_retry_ceiling(3)
        .with_poll_backoff(5, 50);
    config.retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 10,
        max_backoff_ms: 100,
    };
    config
}
