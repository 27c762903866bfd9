//! Prometheus metrics for the workflow engine.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `forge_runs_admitted_total` - Runs admitted by the ingestor
//! - `forge_jobs_emitted_total` - Job requests emitted by the fan-out
//! - `forge_jobs_completed_total` - Job results produced, by status
//! - `forge_jobs_dead_lettered_total` - Requests escalated to the dead-letter sink
//! - `forge_results_discarded_total` - Results dropped by the aggregator, by reason
//! - `forge_runs_finalized_total` - Finalized runs, by outcome
//!
//! ## Gauges
//! - `forge_inflight_jobs` - Render jobs currently holding a concurrency slot
//!
//! ## Histograms
//! - `forge_job_duration_seconds` - Time from first attempt to job result
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, HistogramVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for forge metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RUNS_ADMITTED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new(
        "forge_runs_admitted_total",
        "Total number of runs admitted",
    ))
    .expect("forge_runs_admitted_total metric creation failed")
});

pub static JOBS_EMITTED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new(
        "forge_jobs_emitted_total",
        "Total number of job requests emitted",
    ))
    .expect("forge_jobs_emitted_total metric creation failed")
});

/// Labels:
/// - `status`: `SUCCESS` or `FAILURE`
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "forge_jobs_completed_total",
        "Total number of job results produced",
    );
    CounterVec::new(opts, &["status"])
        .expect("forge_jobs_completed_total metric creation failed")
});

pub static JOBS_DEAD_LETTERED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new(
        "forge_jobs_dead_lettered_total",
        "Total number of dead-lettered job requests",
    ))
    .expect("forge_jobs_dead_lettered_total metric creation failed")
});

/// Labels:
/// - `reason`: `wrong_run`, `duplicate` or `late_arrival`
pub static RESULTS_DISCARDED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "forge_results_discarded_total",
        "Total number of job results discarded by the aggregator",
    );
    CounterVec::new(opts, &["reason"])
        .expect("forge_results_discarded_total metric creation failed")
});

pub static INFLIGHT_JOBS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::with_opts(Opts::new(
        "forge_inflight_jobs",
        "Render jobs currently holding a concurrency slot",
    ))
    .expect("forge_inflight_jobs metric creation failed")
});

/// Labels:
/// - `status`: `SUCCESS` or `FAILURE`
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets =
        exponential_buckets(0.5, 2.0, 14).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "forge_job_duration_seconds",
        "Time from first attempt to job result in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("forge_job_duration_seconds metric creation failed")
});

/// Labels:
/// - `outcome`: `completed` or `timed-out`
pub static RUNS_FINALIZED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "forge_runs_finalized_total",
        "Total number of finalized runs",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("forge_runs_finalized_total metric creation failed")
});

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_ADMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_EMITTED_TOTAL.clone()),
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(JOBS_DEAD_LETTERED_TOTAL.clone()),
        Box::new(RESULTS_DISCARDED_TOTAL.clone()),
        Box::new(INFLIGHT_JOBS.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
        Box::new(RUNS_FINALIZED_TOTAL.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_run_admitted() {
    RUNS_ADMITTED_TOTAL.inc();
}

pub fn record_job_emitted() {
    JOBS_EMITTED_TOTAL.inc();
}

pub fn record_job_completed(status: &str, duration_secs: f64) {
    JOBS_COMPLETED_TOTAL.with_label_values(&[status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn record_job_dead_lettered() {
    JOBS_DEAD_LETTERED_TOTAL.inc();
}

pub fn record_result_discarded(reason: &str) {
    RESULTS_DISCARDED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_inflight_jobs(count: usize) {
    INFLIGHT_JOBS.set(count as f64);
}

pub fn record_run_finalized(outcome: &str) {
    RUNS_FINALIZED_TOTAL.with_label_values(&[outcome]).inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
