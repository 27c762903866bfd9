use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving run ids from revision ids.
const RUN_NAMESPACE: Uuid = Uuid::from_u128(0x6f72_6765_2d72_756e_8000_0000_0000_0001);

/// Opaque key/value payload of a single spreadsheet row.
pub type RowData = serde_json::Map<String, serde_json::Value>;

/// Identifier of a workflow run.
///
/// Derived deterministically from the trigger's revision id so that a retried
/// admission computes the same id it would have written.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn for_revision(revision_id: &str) -> Self {
        Self(Uuid::new_v5(&RUN_NAMESPACE, revision_id.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A change notification for the source document.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub resource_id: String,
    pub revision_id: String,
}

impl TriggerEvent {
    pub fn new(resource_id: impl Into<String>, revision_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            revision_id: revision_id.into(),
        }
    }
}

/// A validated row handed over by the row reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub sku: String,
    pub data: RowData,
}

impl RowRecord {
    pub fn new(sku: impl Into<String>, data: RowData) -> Self {
        Self {
            sku: sku.into(),
            data,
        }
    }
}

/// One render job, emitted once per valid row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub run_id: RunId,
    pub sku: String,
    pub row_data: RowData,
    pub spreadsheet_id: String,
}

/// Terminal status carried by a [`JobResult`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one render job. Deduplicated downstream by `(run_id, sku)`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub run_id: RunId,
    pub sku: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn success(run_id: RunId, sku: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            run_id,
            sku: sku.into(),
            status: JobStatus::Success,
            output_key: Some(output_key.into()),
            error: None,
        }
    }

    pub fn failure(run_id: RunId, sku: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            run_id,
            sku: sku.into(),
            status: JobStatus::Failure,
            output_key: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// Emitted by the fan-out once every job request of a run is out.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRequest {
    pub run_id: RunId,
    pub total_jobs: usize,
    pub invalid_rows_count: usize,
    pub spreadsheet_id: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Completed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::TimedOut => "timed-out",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "timed-out" => Ok(RunStatus::TimedOut),
            other => Err(anyhow::anyhow!("invalid run status: {}", other)),
        }
    }
}

/// One end-to-end execution of the pipeline for a single revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub revision_id: String,
    pub resource_id: String,
    pub spreadsheet_id: Option<String>,
    pub total_jobs: Option<usize>,
    pub invalid_rows_count: Option<usize>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(run_id: RunId, trigger: &TriggerEvent) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            revision_id: trigger.revision_id.clone(),
            resource_id: trigger.resource_id.clone(),
            spreadsheet_id: None,
            total_jobs: None,
            invalid_rows_count: None,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn trigger(&self) -> TriggerEvent {
        TriggerEvent::new(self.resource_id.clone(), self.revision_id.clone())
    }
}

/// Lifecycle state of a single render job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RenderState {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    Rejected,
}

impl RenderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RenderState::Succeeded | RenderState::Failed | RenderState::Rejected
        )
    }
}

/// Storage key used for a rendered poster when the submission does not name one.
pub fn default_output_key(sku: &str) -> String {
    format!("generated/{sku}_poster.pdf")
}
