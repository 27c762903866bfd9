use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{RunId, RunStatus};

/// Metadata envelope attached to every workflow event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Every event derived from a run carries the run id as correlation id.
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(run_id: RunId, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: run_id.as_uuid(),
            idempotency_key: idempotency_key.into(),
            run_id,
            timestamp: Utc::now(),
        }
    }
}

/// Why the aggregator dropped a job result.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The result belongs to another run.
    WrongRun,
    /// The sku was never requested for the run.
    UnknownSku,
    /// A result for the same sku was already counted.
    Duplicate,
    /// The run had already been finalized.
    LateArrival,
}

/// Lifecycle event of a workflow run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub meta: EventMeta,
    pub payload: WorkflowEventPayload,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::WrongRun => "wrong_run",
            DiscardReason::UnknownSku => "unknown_sku",
            DiscardReason::Duplicate => "duplicate",
            DiscardReason::LateArrival => "late_arrival",
        }
    }
}

impl WorkflowEvent {
    pub fn new(run_id: RunId, payload: WorkflowEventPayload) -> Self {
        let key = match payload.sku() {
            Some(sku) => format!("{}:{}:{}", run_id, payload.kind(), sku),
            None => format!("{}:{}", run_id, payload.kind()),
        };
        Self {
            meta: EventMeta::new(run_id, key),
            payload,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.meta.run_id
    }
}

/// Event payload emitted for run and job transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WorkflowEventPayload {
    /// A new run was admitted for the revision.
    RunAdmitted { revision_id: String },
    /// The revision had already been admitted; no new run was started.
    RunDuplicate { revision_id: String },
    /// A job request was handed to the render machines.
    JobEmitted { sku: String },
    /// The render API accepted a submission.
    JobSubmitted {
        sku: String,
        attempt: u32,
        job_status_url: String,
    },
    JobSucceeded { sku: String, output_key: String },
    /// An attempt ended in failure or rejection.
    JobFailed {
        sku: String,
        attempt: u32,
        error: String,
    },
    JobRetryScheduled {
        sku: String,
        attempt: u32,
        delay_ms: u64,
    },
    JobDeadLettered {
        sku: String,
        entry_id: Uuid,
        reason: String,
    },
    ResultDiscarded { sku: String, reason: DiscardReason },
    /// The aggregated report was finalized.
    RunFinalized {
        status: RunStatus,
        successful: usize,
        failed: usize,
        complete: bool,
    },
    /// The run's pipeline stopped with an error; it stays running and is
    /// picked up again by recovery.
    RunFailed { error: String },
}

impl WorkflowEventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEventPayload::RunAdmitted { .. } => "run_admitted",
            WorkflowEventPayload::RunDuplicate { .. } => "run_duplicate",
            WorkflowEventPayload::JobEmitted { .. } => "job_emitted",
            WorkflowEventPayload::JobSubmitted { .. } => "job_submitted",
            WorkflowEventPayload::JobSucceeded { .. } => "job_succeeded",
            WorkflowEventPayload::JobFailed { .. } => "job_failed",
            WorkflowEventPayload::JobRetryScheduled { .. } => {
                "job_retry_scheduled"
            }
            WorkflowEventPayload::JobDeadLettered { .. } => "job_dead_lettered",
            WorkflowEventPayload::ResultDiscarded { .. } => "result_discarded",
            WorkflowEventPayload::RunFinalized { .. } => "run_finalized",
            WorkflowEventPayload::RunFailed { .. } => "run_failed",
        }
    }

    pub fn sku(&self) -> Option<&str> {
        match self {
            WorkflowEventPayload::JobEmitted { sku }
            | WorkflowEventPayload::JobSubmitted { sku, .. }
            | WorkflowEventPayload::JobSucceeded { sku, .. }
            | WorkflowEventPayload::JobFailed { sku, .. }
            | WorkflowEventPayload::JobRetryScheduled { sku, .. }
            | WorkflowEventPayload::JobDeadLettered { sku, .. }
            | WorkflowEventPayload::ResultDiscarded { sku, .. } => Some(sku),
            WorkflowEventPayload::RunAdmitted { .. }
            | WorkflowEventPayload::RunDuplicate { .. }
            | WorkflowEventPayload::RunFinalized { .. }
            | WorkflowEventPayload::RunFailed { .. } => None,
        }
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers: a subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged`. Events are
/// dropped when nobody is subscribed.
pub struct InProcEventBus {
    sender: broadcast::Sender<WorkflowEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish without waiting. Never fails.
    pub fn publish_event(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher<WorkflowEvent> for InProcEventBus {
    async fn publish(&self, event: WorkflowEvent) -> anyhow::Result<()> {
        self.publish_event(event);
        Ok(())
    }
}

impl EventSubscriber<WorkflowEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.subscribe_events()
    }
}
