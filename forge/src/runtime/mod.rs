/// Fan-in of job results into the run report.
pub mod aggregate;
/// Runtime builder with in-memory defaults.
pub mod builder;
/// Fan-out of source rows into job requests.
pub mod fanout;
/// Admission of trigger events.
pub mod ingest;
/// Render state machine and retry driver.
pub mod render;
/// Runtime supervisor owning run pipelines and shutdown.
pub mod supervisor;
/// Render polling configuration.
pub mod worker;

pub use aggregate::FanInAggregator;
pub use builder::WorkflowRuntimeBuilder;
pub use fanout::{FanOutCoordinator, FanOutPlan, FanOutSummary, JobSink};
pub use ingest::{Admission, EventIngestor};
pub use render::{AttemptOutcome, AttemptRun, JobRunner, RenderMachine};
pub use supervisor::{ShutdownToken, WorkflowRuntime};
pub use worker::RenderConfig;
