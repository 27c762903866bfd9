//! Forge - fan-out/fan-in coordination for batch render workflows.
//!
//! A trigger names a revision of a source document. Forge admits each
//! revision once, reads its rows, renders one artifact per valid row through
//! an external render API under a shared concurrency ceiling, and collects the
//! per-row results into a single report.
//!
//! # Core Concepts
//!
//! - **Step log**: The [`StepLog`] trait records the intent of every side
//!   effect before it happens and its outcome after. Recovery replays the
//!   log, so an accepted submission is never sent twice and a report is
//!   finalized once.
//!
//! - **Admission**: [`EventIngestor`] derives a deterministic [`RunId`] from
//!   the revision id and starts at most one run per revision.
//!
//! - **Fan-out**: [`FanOutCoordinator`] turns rows into [`JobRequest`]s and one
//!   [`AggregationRequest`].
//!
//! - **Render**: [`RenderMachine`] submits and polls a render job while
//!   holding a [`Budget`] slot; [`JobRunner`] applies retries and dead-letter
//!   escalation and emits exactly one [`JobResult`].
//!
//! - **Fan-in**: [`FanInAggregator`] deduplicates results per run and
//!   finalizes an [`AggregatedReport`] on completion or timeout.
//!
//! - **Runtime**: [`WorkflowRuntime`] wires it all together.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL step log via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use forge::*;
//!
//! let runtime = WorkflowRuntimeBuilder::new(AppConfig::from_env()?)
//!     .with_row_reader(reader)
//!     .with_render_client(client)
//!     .build()?;
//!
//! let admission = runtime
//!     .handle_trigger(&TriggerEvent::new("sheet-doc", "rev-42"))
//!     .await?;
//! let report = runtime.await_run(admission.run_id).await?;
//! println!("{}", report.summary_text());
//! ```

/// Concurrency limiting for render jobs.
///
/// Provides the [`Budget`] trait and the semaphore-backed
/// [`InMemoryBudget`].
pub mod budget;

/// Collaborator traits: row reader, render client, report delivery.
pub mod client;

/// Application configuration loaded from TOML per environment.
pub mod config;

/// Parking lot for requests that were given up on.
pub mod dead_letter;

/// Typed errors at collaborator boundaries.
pub mod error;

/// Workflow lifecycle events and the in-process event bus.
///
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`WorkflowEvent`] and [`WorkflowEventPayload`] for event data
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// Core payloads: triggers, job requests and results, runs.
pub mod job;

pub mod logging;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// Provides a PostgreSQL-backed step log when the `postgres` feature is
/// enabled.
pub mod persistence;

/// Aggregated run report.
pub mod report;

/// Retry and backoff policy.
pub mod retry;

/// Per-run routing of job results to the aggregator.
pub mod router;

/// Normalization of sheet grids into validated rows.
pub mod rows;

/// Runtime orchestration: admission, fan-out, render, fan-in.
///
/// - [`WorkflowRuntime`] - main runtime type
/// - [`WorkflowRuntimeBuilder`] - dependency wiring
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`RenderConfig`] - render polling configuration
pub mod runtime;

/// Durable step log.
pub mod steplog;

pub mod telemetry;

pub use budget::*;
pub use client::*;
pub use config::*;
pub use dead_letter::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use report::*;
pub use retry::*;
pub use router::*;
pub use runtime::*;
pub use steplog::{AdmitOutcome, InMemoryStepLog, StepLog, StepRecord, StepState, StepWrite};
