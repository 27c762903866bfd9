//! Tracing spans and lifecycle recording helpers.
//!
//! Every `record_*` function logs through `tracing` and, when the `metrics`
//! feature is enabled, updates the matching Prometheus metric.
//!
//! # Example
//!
//! ```ignore
//! use forge::telemetry::{render_span, record_job_completed};
//!
//! let span = render_span(run_id, "SKU-1");
//! let _enter = span.enter();
//! record_job_completed(run_id, "SKU-1", "SUCCESS", 4.2);
//! ```

use std::fmt::Display;
use tracing::{info_span, Span};

#[must_use]
pub fn admit_span(revision_id: impl AsRef<str>) -> Span {
    info_span!("forge.admit", revision_id = %revision_id.as_ref())
}

#[must_use]
pub fn fan_out_span(run_id: impl Display) -> Span {
    info_span!("forge.fan_out", run_id = %run_id)
}

/// Span covering every attempt of one render job.
#[must_use]
pub fn render_span(run_id: impl Display, sku: impl AsRef<str>) -> Span {
    info_span!("forge.render", run_id = %run_id, sku = %sku.as_ref())
}

#[must_use]
pub fn poll_span(sku: impl AsRef<str>, attempt: u32) -> Span {
    info_span!("forge.poll", sku = %sku.as_ref(), attempt = attempt)
}

#[must_use]
pub fn aggregate_span(run_id: impl Display, expected: usize) -> Span {
    info_span!("forge.aggregate", run_id = %run_id, expected = expected)
}

#[must_use]
pub fn redrive_span(entry_id: impl Display, sku: impl AsRef<str>) -> Span {
    info_span!("forge.redrive", entry_id = %entry_id, sku = %sku.as_ref())
}

pub fn record_run_admitted(run_id: impl Display, revision_id: impl AsRef<str>) {
    tracing::info!(
        run_id = %run_id,
        revision_id = %revision_id.as_ref(),
        "run admitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_admitted();
}

pub fn record_job_emitted(run_id: impl Display, sku: impl AsRef<str>) {
    tracing::debug!(run_id = %run_id, sku = %sku.as_ref(), "job emitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_emitted();
}

pub fn record_job_completed(
    run_id: impl Display,
    sku: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::info!(
        run_id = %run_id,
        sku = %sku.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "job completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(status.as_ref(), duration_secs);
}

pub fn record_job_dead_lettered(
    run_id: impl Display,
    sku: impl AsRef<str>,
    reason: impl AsRef<str>,
) {
    tracing::warn!(
        run_id = %run_id,
        sku = %sku.as_ref(),
        reason = %reason.as_ref(),
        "job dead-lettered"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_dead_lettered();
}

pub fn record_result_discarded(
    run_id: impl Display,
    sku: impl AsRef<str>,
    reason: impl AsRef<str>,
) {
    tracing::debug!(
        run_id = %run_id,
        sku = %sku.as_ref(),
        reason = %reason.as_ref(),
        "result discarded"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_result_discarded(reason.as_ref());
}

/// Update the in-flight gauge from a limiter utilization sample.
pub fn set_inflight_jobs(in_flight: usize, limit: usize) {
    tracing::debug!(in_flight, limit, "render slots updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_inflight_jobs(in_flight);
}

pub fn record_run_finalized(
    run_id: impl Display,
    outcome: impl AsRef<str>,
    successful: usize,
    failed: usize,
) {
    tracing::info!(
        run_id = %run_id,
        outcome = %outcome.as_ref(),
        successful,
        failed,
        "run finalized"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finalized(outcome.as_ref());
}

/// Start timing a job. Pass the handle to [`record_job_end`].
pub fn record_job_start(sku: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        sku: sku.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

pub fn record_job_end(
    handle: JobTimingHandle,
    run_id: impl Display,
    status: impl AsRef<str>,
) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    record_job_completed(run_id, &handle.sku, status, duration_secs);
}

/// Opaque timing handle returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    sku: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn sku(&self) -> &str {
        &self.sku
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
