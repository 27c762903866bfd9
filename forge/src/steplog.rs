use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::job::{RunId, RunStatus, WorkflowRun};

/// Progress of a single step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Recorded before the side effect is attempted.
    Intent,
    /// The side effect finished; `outcome` holds its result.
    Done,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Intent => "intent",
            StepState::Done => "done",
        }
    }
}

impl std::str::FromStr for StepState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intent" => Ok(StepState::Intent),
            "done" => Ok(StepState::Done),
            other => Err(anyhow!("invalid step state: {}", other)),
        }
    }
}

/// A single entry of the durable step log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: RunId,
    pub step: String,
    pub state: StepState,
    pub intent: serde_json::Value,
    pub outcome: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(run_id: RunId, step: impl Into<String>, intent: serde_json::Value) -> Self {
        Self {
            run_id,
            step: step.into(),
            state: StepState::Intent,
            intent,
            outcome: None,
            recorded_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == StepState::Done
    }

    pub fn intent_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.intent.clone())
            .with_context(|| format!("decoding intent of step {}", self.step))
    }

    /// Decode the outcome payload. `None` while the step is still an intent.
    pub fn outcome_as<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        match &self.outcome {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("decoding outcome of step {}", self.step)),
            None => Ok(None),
        }
    }
}

/// Result of an insert-if-absent write.
#[derive(Clone, Debug, PartialEq)]
pub enum StepWrite {
    /// This call created the record.
    Inserted(StepRecord),
    /// The record already existed and was left untouched.
    Existing(StepRecord),
}

impl StepWrite {
    pub fn inserted(&self) -> bool {
        matches!(self, StepWrite::Inserted(_))
    }

    pub fn record(&self) -> &StepRecord {
        match self {
            StepWrite::Inserted(record) | StepWrite::Existing(record) => record,
        }
    }
}

/// Outcome of admitting a run by revision id.
#[derive(Clone, Debug, PartialEq)]
pub struct AdmitOutcome {
    /// The run stored for the revision; the pre-existing one if `created` is false.
    pub run: WorkflowRun,
    pub created: bool,
}

/// Append-only log of runs and their steps.
///
/// Every write is insert-if-absent: racing writers of the same key observe a
/// single winner, and replays of an already recorded step return the record
/// that was written first.
#[async_trait]
pub trait StepLog: Send + Sync {
    /// Insert the run unless one already exists for its revision id.
    async fn admit(&self, run: WorkflowRun) -> anyhow::Result<AdmitOutcome>;

    async fn run(&self, run_id: RunId) -> anyhow::Result<Option<WorkflowRun>>;

    async fn run_for_revision(
        &self,
        revision_id: &str,
    ) -> anyhow::Result<Option<WorkflowRun>>;

    async fn runs_with_status(
        &self,
        status: RunStatus,
    ) -> anyhow::Result<Vec<WorkflowRun>>;

    async fn set_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
    ) -> anyhow::Result<()>;

    /// Record the fan-out totals. Totals are written once; later calls keep
    /// the first values.
    async fn set_run_totals(
        &self,
        run_id: RunId,
        spreadsheet_id: &str,
        total_jobs: usize,
        invalid_rows_count: usize,
    ) -> anyhow::Result<()>;

    /// Record the intent of a step unless the step already exists.
    async fn record_intent(
        &self,
        run_id: RunId,
        step: &str,
        intent: serde_json::Value,
    ) -> anyhow::Result<StepWrite>;

    /// Mark a step done. The first outcome wins; completing a done step
    /// returns the stored record unchanged. Completing an unknown step fails.
    async fn complete_step(
        &self,
        run_id: RunId,
        step: &str,
        outcome: Option<serde_json::Value>,
    ) -> anyhow::Result<StepRecord>;

    async fn step(
        &self,
        run_id: RunId,
        step: &str,
    ) -> anyhow::Result<Option<StepRecord>>;

    /// All steps of a run in the order they were first recorded.
    async fn steps_for_run(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Vec<StepRecord>>;
}

/// Step name conventions shared by the coordinator, render machines and
/// aggregator.
pub mod steps {
    pub const FAN_OUT: &str = "fan-out";
    pub const AGGREGATE_REQUEST: &str = "aggregate/request";
    pub const AGGREGATE_FINALIZE: &str = "aggregate/finalize";
    pub const AGGREGATE_RESULT_PREFIX: &str = "aggregate/result/";
    pub const REQUEST_PREFIX: &str = "request/";

    /// Scope of the render steps emitted by a regular fan-out.
    pub const RENDER_SCOPE: &str = "render";

    pub fn request(sku: &str) -> String {
        format!("{REQUEST_PREFIX}{sku}")
    }

    pub fn aggregate_result(sku: &str) -> String {
        format!("{AGGREGATE_RESULT_PREFIX}{sku}")
    }

    pub fn submit(scope: &str, sku: &str, attempt: u32) -> String {
        format!("{scope}/{sku}/attempt-{attempt}/submit")
    }

    pub fn attempt_outcome(scope: &str, sku: &str, attempt: u32) -> String {
        format!("{scope}/{sku}/attempt-{attempt}/outcome")
    }

    pub fn result(scope: &str, sku: &str) -> String {
        format!("{scope}/{sku}/result")
    }

    pub fn dead_letter(scope: &str, sku: &str) -> String {
        format!("{scope}/{sku}/dead-letter")
    }

    /// Scope used when a dead-lettered request is run again.
    pub fn redrive_scope(entry_id: &str) -> String {
        format!("redrive-{entry_id}")
    }
}

#[derive(Default)]
struct RunSteps {
    order: Vec<String>,
    records: HashMap<String, StepRecord>,
}

#[derive(Default)]
struct LogState {
    runs: HashMap<RunId, WorkflowRun>,
    revisions: HashMap<String, RunId>,
    steps: HashMap<RunId, RunSteps>,
}

/// Default in-memory step log.
///
/// Survives retries within a process; not durable across restarts.
#[derive(Clone, Default)]
pub struct InMemoryStepLog {
    state: Arc<Mutex<LogState>>,
}

impl std::fmt::Debug for InMemoryStepLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryStepLog");

        match self.state.try_lock() {
            Ok(state) => {
                debug.field("runs", &state.runs.len());
            }
            Err(_) => {
                debug.field("runs", &"<locked>");
            }
        }

        debug.finish_non_exhaustive()
    }
}

impl InMemoryStepLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepLog for InMemoryStepLog {
    async fn admit(&self, run: WorkflowRun) -> anyhow::Result<AdmitOutcome> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .revisions
            .get(&run.revision_id)
            .and_then(|run_id| state.runs.get(run_id))
        {
            return Ok(AdmitOutcome {
                run: existing.clone(),
                created: false,
            });
        }

        state.revisions.insert(run.revision_id.clone(), run.run_id);
        state.runs.insert(run.run_id, run.clone());
        Ok(AdmitOutcome { run, created: true })
    }

    async fn run(&self, run_id: RunId) -> anyhow::Result<Option<WorkflowRun>> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn run_for_revision(
        &self,
        revision_id: &str,
    ) -> anyhow::Result<Option<WorkflowRun>> {
        let state = self.state.lock().await;
        Ok(state
            .revisions
            .get(revision_id)
            .and_then(|run_id| state.runs.get(run_id))
            .cloned())
    }

    async fn runs_with_status(
        &self,
        status: RunStatus,
    ) -> anyhow::Result<Vec<WorkflowRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|run| run.status == status)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn set_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;
        run.status = status;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn set_run_totals(
        &self,
        run_id: RunId,
        spreadsheet_id: &str,
        total_jobs: usize,
        invalid_rows_count: usize,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;
        if run.total_jobs.is_some() {
            return Ok(());
        }
        run.spreadsheet_id = Some(spreadsheet_id.to_string());
        run.total_jobs = Some(total_jobs);
        run.invalid_rows_count = Some(invalid_rows_count);
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn record_intent(
        &self,
        run_id: RunId,
        step: &str,
        intent: serde_json::Value,
    ) -> anyhow::Result<StepWrite> {
        let mut state = self.state.lock().await;
        let steps = state.steps.entry(run_id).or_default();

        if let Some(existing) = steps.records.get(step) {
            return Ok(StepWrite::Existing(existing.clone()));
        }

        let record = StepRecord::new(run_id, step, intent);
        steps.order.push(step.to_string());
        steps.records.insert(step.to_string(), record.clone());
        Ok(StepWrite::Inserted(record))
    }

    async fn complete_step(
        &self,
        run_id: RunId,
        step: &str,
        outcome: Option<serde_json::Value>,
    ) -> anyhow::Result<StepRecord> {
        let mut state = self.state.lock().await;
        let record = state
            .steps
            .get_mut(&run_id)
            .and_then(|steps| steps.records.get_mut(step))
            .ok_or_else(|| {
                anyhow!("step {} of run {} has no recorded intent", step, run_id)
            })?;

        if record.state == StepState::Intent {
            record.state = StepState::Done;
            record.outcome = outcome;
            record.completed_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    async fn step(
        &self,
        run_id: RunId,
        step: &str,
    ) -> anyhow::Result<Option<StepRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .get(&run_id)
            .and_then(|steps| steps.records.get(step))
            .cloned())
    }

    async fn steps_for_run(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Vec<StepRecord>> {
        let state = self.state.lock().await;
        let Some(steps) = state.steps.get(&run_id) else {
            return Ok(Vec::new());
        };
        Ok(steps
            .order
            .iter()
            .filter_map(|name| steps.records.get(name).cloned())
            .collect())
    }
}
