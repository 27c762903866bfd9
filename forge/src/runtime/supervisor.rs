use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::budget::Budget;
use crate::client::RowReader;
use crate::config::AppConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::error::AdmissionError;
use crate::events::{InProcEventBus, WorkflowEvent, WorkflowEventPayload};
use crate::job::{
    AggregationRequest, JobRequest, JobResult, RunId, RunStatus, TriggerEvent,
    WorkflowRun,
};
use crate::report::AggregatedReport;
use crate::router::ResultRouter;
use crate::steplog::{steps, StepLog};
use crate::telemetry;

use super::aggregate::FanInAggregator;
use super::fanout::{FanOutCoordinator, JobSink};
use super::ingest::{Admission, EventIngestor};
use super::render::JobRunner;

/// Token for signaling graceful shutdown to pipelines and render machines.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not lost.
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

async fn track(tasks: &TaskList, handle: JoinHandle<()>) {
    let mut guard = tasks.lock().await;
    guard.retain(|task| !task.is_finished());
    guard.push(handle);
}

/// Hands every emitted request to its own render task.
struct SpawningSink {
    runner: JobRunner,
    tasks: TaskList,
}

#[async_trait]
impl JobSink for SpawningSink {
    async fn emit_job(&self, request: JobRequest) -> anyhow::Result<()> {
        let runner = self.runner.clone();
        let span = telemetry::render_span(request.run_id, &request.sku);

        let handle = tokio::spawn(
            async move {
                let sku = request.sku.clone();
                if let Err(err) = runner.run(request, steps::RENDER_SCOPE).await {
                    error!(sku = %sku, error = ?err, "render job stopped");
                }
            }
            .instrument(span),
        );
        track(&self.tasks, handle).await;
        Ok(())
    }

    /// The pipeline aggregates in-process from the fan-out summary.
    async fn emit_aggregation(
        &self,
        _request: AggregationRequest,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything one run needs, cheap to clone into its task.
#[derive(Clone)]
struct Pipeline {
    reader: Arc<dyn RowReader>,
    events: Arc<InProcEventBus>,
    router: ResultRouter,
    coordinator: FanOutCoordinator,
    runner: JobRunner,
    aggregator: FanInAggregator,
    shutdown: ShutdownToken,
    tasks: TaskList,
    active: Arc<Mutex<HashSet<RunId>>>,
}

impl Pipeline {
    /// Spawn the pipeline of `run` unless one is already running for it.
    async fn spawn(&self, run: WorkflowRun) -> bool {
        if !self.active.lock().await.insert(run.run_id) {
            return false;
        }

        let pipeline = self.clone();
        let handle = tokio::spawn(async move {
            let run_id = run.run_id;
            let outcome = pipeline.run(run).await;
            pipeline.active.lock().await.remove(&run_id);

            match outcome {
                Ok(report) => info!(
                    run_id = %run_id,
                    successful = report.successful_jobs.len(),
                    failed = report.failed_jobs.len(),
                    complete = report.complete,
                    "run finished"
                ),
                Err(err) if pipeline.shutdown.is_cancelled() => {
                    info!(run_id = %run_id, error = %err, "run interrupted by shutdown");
                }
                Err(err) => {
                    error!(run_id = %run_id, error = ?err, "run failed");
                    pipeline.events.publish_event(WorkflowEvent::new(
                        run_id,
                        WorkflowEventPayload::RunFailed {
                            error: format!("{:#}", err),
                        },
                    ));
                }
            }
        });
        track(&self.tasks, handle).await;
        true
    }

    async fn run(&self, run: WorkflowRun) -> anyhow::Result<AggregatedReport> {
        let run_id = run.run_id;

        let rows = match self.coordinator.recorded_rows(run_id).await? {
            Some(rows) => rows,
            None => self
                .reader
                .read_rows(&run.trigger())
                .await
                .with_context(|| {
                    format!("reading rows of revision {}", run.revision_id)
                })?,
        };

        let subscription = self.router.subscribe(run_id).await;
        let sink = SpawningSink {
            runner: self.runner.clone(),
            tasks: self.tasks.clone(),
        };
        let summary = self.coordinator.fan_out(run_id, rows, &sink).await?;

        if summary.requires_empty_report() {
            return self
                .aggregator
                .finalize_empty(
                    run_id,
                    &summary.spreadsheet_id,
                    summary.invalid_rows_count,
                )
                .await;
        }

        let request = summary
            .aggregation
            .ok_or_else(|| anyhow!("fan-out of run {} emitted no aggregation", run_id))?;
        self.aggregator.aggregate(&request, subscription).await
    }
}

/// Workflow runtime: admits triggers and drives their runs to a report.
pub struct WorkflowRuntime {
    config: AppConfig,
    log: Arc<dyn StepLog>,
    budget: Arc<dyn Budget>,
    dead_letters: Arc<dyn DeadLetterSink>,
    events: Arc<InProcEventBus>,
    ingestor: EventIngestor,
    pipeline: Pipeline,
    shutdown_token: ShutdownToken,
}

impl fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .pipeline
            .tasks
            .try_lock()
            .map(|tasks| tasks.len())
            .unwrap_or_default();
        let active_runs = self
            .pipeline
            .active
            .try_lock()
            .map(|active| active.len())
            .unwrap_or_default();

        f.debug_struct("WorkflowRuntime")
            .field("environment", &self.config.environment)
            .field("events", &self.events)
            .field("task_count", &task_count)
            .field("active_runs", &active_runs)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

/// Collaborators the runtime is assembled from.
pub(crate) struct RuntimeParts {
    pub log: Arc<dyn StepLog>,
    pub budget: Arc<dyn Budget>,
    pub reader: Arc<dyn RowReader>,
    pub client: Arc<dyn crate::client::RenderClient>,
    pub delivery: Arc<dyn crate::client::ReportDelivery>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub events: Arc<InProcEventBus>,
}

impl WorkflowRuntime {
    pub(crate) fn new(config: AppConfig, parts: RuntimeParts) -> Self {
        let shutdown_token = ShutdownToken::new();
        let router = ResultRouter::new();

        let machine = super::render::RenderMachine::new(
            parts.client,
            parts.budget.clone(),
            parts.log.clone(),
            parts.events.clone(),
            config.render.clone(),
            shutdown_token.clone(),
        );
        let runner = JobRunner::new(
            machine,
            parts.log.clone(),
            parts.dead_letters.clone(),
            router.clone(),
            parts.events.clone(),
            config.retry.clone(),
            shutdown_token.clone(),
        );
        let aggregator = FanInAggregator::new(
            parts.log.clone(),
            router.clone(),
            parts.delivery,
            parts.events.clone(),
            config.aggregation.timeout(),
            shutdown_token.clone(),
        );

        let pipeline = Pipeline {
            reader: parts.reader,
            events: parts.events.clone(),
            router,
            coordinator: FanOutCoordinator::new(parts.log.clone(), parts.events.clone()),
            runner,
            aggregator,
            shutdown: shutdown_token.clone(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(Mutex::new(HashSet::new())),
        };

        Self {
            ingestor: EventIngestor::new(parts.log.clone(), parts.events.clone()),
            config,
            log: parts.log,
            budget: parts.budget,
            dead_letters: parts.dead_letters,
            events: parts.events,
            pipeline,
            shutdown_token,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn step_log(&self) -> Arc<dyn StepLog> {
        Arc::clone(&self.log)
    }

    pub fn budget(&self) -> Arc<dyn Budget> {
        Arc::clone(&self.budget)
    }

    /// Subscribe to lifecycle events of every run.
    pub fn events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe_events()
    }

    /// Admit a trigger and, when it starts a new run, launch the run in the
    /// background. Duplicate triggers return the existing run id.
    pub async fn handle_trigger(
        &self,
        trigger: &TriggerEvent,
    ) -> Result<Admission, AdmissionError> {
        let admission = self.ingestor.admit(trigger).await?;

        if admission.admitted {
            let trigger = TriggerEvent::new(
                trigger.resource_id.clone(),
                trigger.revision_id.trim(),
            );
            self.pipeline
                .spawn(WorkflowRun::new(admission.run_id, &trigger))
                .await;
        }

        Ok(admission)
    }

    /// Wait for the report of a run.
    ///
    /// Returns at once for a run that was already finalized. Fails when the
    /// run is unknown, when its pipeline stops with an error, or on shutdown.
    pub async fn await_run(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<AggregatedReport> {
        let mut events = self.events.subscribe_events();

        loop {
            if let Some(report) = self.finalized_report(run_id).await? {
                return Ok(report);
            }
            if self.log.run(run_id).await?.is_none() {
                bail!("unknown run {}", run_id);
            }

            loop {
                let received = tokio::select! {
                    _ = self.shutdown_token.cancelled() => {
                        bail!("runtime shut down before run {} finished", run_id)
                    }
                    received = events.recv() => received,
                };

                match received {
                    Ok(event) if event.run_id() == run_id => match event.payload {
                        WorkflowEventPayload::RunFinalized { .. } => break,
                        WorkflowEventPayload::RunFailed { error } => {
                            bail!("run {} failed: {}", run_id, error)
                        }
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(run_id = %run_id, skipped, "event subscriber lagged");
                        break;
                    }
                    Err(RecvError::Closed) => bail!("event bus closed"),
                }
            }
        }
    }

    async fn finalized_report(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Option<AggregatedReport>> {
        match self.log.step(run_id, steps::AGGREGATE_FINALIZE).await? {
            Some(record) if record.is_done() => Ok(Some(record.intent_as()?)),
            _ => Ok(None),
        }
    }

    /// Resume every run the step log still reports as running.
    ///
    /// Recorded steps are replayed: accepted submissions resume polling,
    /// emitted results are not emitted twice and a finalized report is not
    /// delivered again.
    pub async fn recover(&self) -> anyhow::Result<Vec<RunId>> {
        let runs = self.log.runs_with_status(RunStatus::Running).await?;
        let mut resumed = Vec::with_capacity(runs.len());

        for run in runs {
            let run_id = run.run_id;
            if self.pipeline.spawn(run).await {
                info!(run_id = %run_id, "resuming run");
                resumed.push(run_id);
            }
        }

        Ok(resumed)
    }

    pub async fn dead_letters(&self) -> anyhow::Result<Vec<DeadLetterEntry>> {
        self.dead_letters.list().await
    }

    /// Run a dead-lettered request again under a fresh step scope.
    ///
    /// The entry leaves the sink; a request that fails again is dead-lettered
    /// under a new entry id.
    pub async fn redrive(&self, entry_id: Uuid) -> anyhow::Result<JobResult> {
        let entry = self
            .dead_letters
            .take(entry_id)
            .await?
            .ok_or_else(|| anyhow!("dead-letter entry {} not found", entry_id))?;

        let scope = steps::redrive_scope(&entry_id.to_string());
        let span = telemetry::redrive_span(entry_id, &entry.request.sku);
        info!(entry_id = %entry_id, sku = %entry.request.sku, "redriving request");

        match self
            .pipeline
            .runner
            .run(entry.request.clone(), &scope)
            .instrument(span)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                self.dead_letters.dead_letter(entry).await?;
                Err(err.context(format!("redrive of entry {} failed", entry_id)))
            }
        }
    }

    /// Gracefully shut down the runtime and every task it spawned.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("shutting down workflow runtime");

        self.shutdown_token.cancel();

        loop {
            let handles = {
                let mut guard = self.pipeline.tasks.lock().await;
                std::mem::take(&mut *guard)
            };
            if handles.is_empty() {
                break;
            }

            for handle in handles {
                match tokio::time::timeout(
                    tokio::time::Duration::from_secs(30),
                    handle,
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("runtime task failed: {:?}", e),
                    Err(_) => warn!("runtime task timed out during shutdown"),
                }
            }
        }

        info!("workflow runtime shutdown complete");
        Ok(())
    }
}
