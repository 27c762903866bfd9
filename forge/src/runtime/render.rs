use std::sync::Arc;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn, Instrument};

use crate::budget::Budget;
use crate::client::{RenderClient, Submission};
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::error::PollError;
use crate::events::{DiscardReason, InProcEventBus, WorkflowEvent, WorkflowEventPayload};
use crate::job::{default_output_key, JobRequest, JobResult, RenderState};
use crate::retry::{exponential_backoff, process_failure, FailureDisposition, RetryConfig};
use crate::router::{Delivery, ResultRouter};
use crate::steplog::{steps, StepLog};
use crate::telemetry;

use super::supervisor::ShutdownToken;
use super::worker::RenderConfig;

/// Terminal outcome of one submit-and-poll attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded { output_key: String },
    Failed { error: String },
    /// The submission itself failed. Never retried.
    Rejected { reason: String },
}

impl AttemptOutcome {
    pub fn state(&self) -> RenderState {
        match self {
            AttemptOutcome::Succeeded { .. } => RenderState::Succeeded,
            AttemptOutcome::Failed { .. } => RenderState::Failed,
            AttemptOutcome::Rejected { .. } => RenderState::Rejected,
        }
    }
}

/// Outcome of a submit step, recorded once the render API answered.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SubmitRecord {
    Accepted { submission: Submission },
    Rejected { reason: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttemptRun {
    pub outcome: AttemptOutcome,
    /// True when the outcome was read back from the step log.
    pub replayed: bool,
}

/// Submit-then-poll state machine for one render attempt.
///
/// Holds a limiter slot from submission until the attempt reaches a terminal
/// state. A submission already recorded as accepted is never sent again; the
/// machine resumes polling the recorded job status URL instead.
#[derive(Clone)]
pub struct RenderMachine {
    client: Arc<dyn RenderClient>,
    budget: Arc<dyn Budget>,
    log: Arc<dyn StepLog>,
    events: Arc<InProcEventBus>,
    config: RenderConfig,
    shutdown: ShutdownToken,
}

impl RenderMachine {
    pub fn new(
        client: Arc<dyn RenderClient>,
        budget: Arc<dyn Budget>,
        log: Arc<dyn StepLog>,
        events: Arc<InProcEventBus>,
        config: RenderConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            client,
            budget,
            log,
            events,
            config,
            shutdown,
        }
    }

    pub async fn run_attempt(
        &self,
        request: &JobRequest,
        scope: &str,
        attempt: u32,
    ) -> anyhow::Result<AttemptRun> {
        let run_id = request.run_id;
        let sku = request.sku.as_str();
        let outcome_step = steps::attempt_outcome(scope, sku, attempt);

        if let Some(record) = self.log.step(run_id, &outcome_step).await? {
            if let Some(outcome) = record.outcome_as::<AttemptOutcome>()? {
                debug!(sku, attempt, state = ?outcome.state(), "attempt replayed from log");
                return Ok(AttemptRun {
                    outcome,
                    replayed: true,
                });
            }
        }

        self.log
            .record_intent(
                run_id,
                &outcome_step,
                json!({ "sku": sku, "attempt": attempt }),
            )
            .await?;

        let holder = format!("{}/{}", run_id, sku);
        let token = self.budget.acquire(&holder).await?;
        self.report_utilization().await;

        let result = self.submit_and_poll(request, scope, attempt).await;

        self.budget.release(token).await?;
        self.report_utilization().await;

        let outcome = result?;
        self.log
            .complete_step(
                run_id,
                &outcome_step,
                Some(serde_json::to_value(&outcome)?),
            )
            .await?;

        Ok(AttemptRun {
            outcome,
            replayed: false,
        })
    }

    async fn submit_and_poll(
        &self,
        request: &JobRequest,
        scope: &str,
        attempt: u32,
    ) -> anyhow::Result<AttemptOutcome> {
        let submission = match self.submit(request, scope, attempt).await? {
            SubmitRecord::Accepted { submission } => submission,
            SubmitRecord::Rejected { reason } => {
                return Ok(AttemptOutcome::Rejected { reason });
            }
        };

        self.poll_until_terminal(request, &submission)
            .instrument(telemetry::poll_span(&request.sku, attempt))
            .await
    }

    async fn submit(
        &self,
        request: &JobRequest,
        scope: &str,
        attempt: u32,
    ) -> anyhow::Result<SubmitRecord> {
        let run_id = request.run_id;
        let submit_step = steps::submit(scope, &request.sku, attempt);

        let write = self
            .log
            .record_intent(
                run_id,
                &submit_step,
                json!({ "sku": request.sku, "attempt": attempt }),
            )
            .await?;
        if let Some(recorded) = write.record().outcome_as::<SubmitRecord>()? {
            info!(sku = %request.sku, attempt, "resuming recorded submission");
            return Ok(recorded);
        }

        let record = match self.client.submit(request).await {
            Ok(submission) => SubmitRecord::Accepted { submission },
            Err(err) => {
                warn!(sku = %request.sku, attempt, error = %err, "submission rejected");
                SubmitRecord::Rejected {
                    reason: err.to_string(),
                }
            }
        };

        let stored = self
            .log
            .complete_step(run_id, &submit_step, Some(serde_json::to_value(&record)?))
            .await?;
        let record = stored.outcome_as::<SubmitRecord>()?.unwrap_or(record);

        if let SubmitRecord::Accepted { submission } = &record {
            self.events.publish_event(WorkflowEvent::new(
                run_id,
                WorkflowEventPayload::JobSubmitted {
                    sku: request.sku.clone(),
                    attempt,
                    job_status_url: submission.job_status_url.clone(),
                },
            ));
        }

        Ok(record)
    }

    async fn poll_until_terminal(
        &self,
        request: &JobRequest,
        submission: &Submission,
    ) -> anyhow::Result<AttemptOutcome> {
        let mut transient_errors = 0u32;

        loop {
            self.pause(self.config.poll_interval()).await?;

            match self.client.poll(&submission.job_status_url).await {
                Ok(status) if status.is_pending() => {
                    transient_errors = 0;
                    debug!(sku = %request.sku, status = %status.status, "render pending");
                }
                Ok(status) if status.is_succeeded() => {
                    let output_key = submission
                        .output_key
                        .clone()
                        .unwrap_or_else(|| default_output_key(&request.sku));
                    return Ok(AttemptOutcome::Succeeded { output_key });
                }
                Ok(status) => {
                    return Ok(AttemptOutcome::Failed {
                        error: status.failure_message(),
                    });
                }
                Err(PollError::Transient(message)) => {
                    transient_errors += 1;
                    if transient_errors >= self.config.poll_retry_ceiling {
                        return Ok(AttemptOutcome::Failed {
                            error: format!(
                                "polling gave up after {} transient errors: {}",
                                transient_errors, message
                            ),
                        });
                    }

                    let delay = exponential_backoff(
                        transient_errors,
                        self.config.poll_backoff_ms,
                        self.config.max_poll_backoff_ms,
                    );
                    warn!(
                        sku = %request.sku,
                        transient_errors,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient poll error, backing off"
                    );
                    self.pause(delay).await?;
                }
                Err(err @ PollError::Fatal(_)) => {
                    return Ok(AttemptOutcome::Failed {
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    async fn pause(&self, duration: std::time::Duration) -> anyhow::Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => bail!("shutdown requested"),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn report_utilization(&self) {
        if let Ok((in_flight, limit)) = self.budget.utilization().await {
            telemetry::set_inflight_jobs(in_flight, limit);
        }
    }
}

/// Drives a request through attempts until it produces exactly one
/// [`JobResult`], applying the retry policy and the dead-letter escalation.
#[derive(Clone)]
pub struct JobRunner {
    machine: RenderMachine,
    log: Arc<dyn StepLog>,
    dead_letters: Arc<dyn DeadLetterSink>,
    router: ResultRouter,
    events: Arc<InProcEventBus>,
    retry: RetryConfig,
    shutdown: ShutdownToken,
}

impl JobRunner {
    pub fn new(
        machine: RenderMachine,
        log: Arc<dyn StepLog>,
        dead_letters: Arc<dyn DeadLetterSink>,
        router: ResultRouter,
        events: Arc<InProcEventBus>,
        retry: RetryConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            machine,
            log,
            dead_letters,
            router,
            events,
            retry,
            shutdown,
        }
    }

    /// Run `request` under the step scope `scope` and route its result.
    pub async fn run(
        &self,
        request: JobRequest,
        scope: &str,
    ) -> anyhow::Result<JobResult> {
        let run_id = request.run_id;
        let result_step = steps::result(scope, &request.sku);

        // A recorded result is routed again even when it was emitted before:
        // the aggregator that received it may not have recorded it.
        if let Some(record) = self.log.step(run_id, &result_step).await? {
            debug!(sku = %request.sku, emitted = record.is_done(), "re-routing recorded result");
            return self.emit_result(scope, record.intent_as()?).await;
        }

        let timing = telemetry::record_job_start(&request.sku);
        let mut attempt = 1u32;

        let result = loop {
            let run = self.machine.run_attempt(&request, scope, attempt).await?;

            match run.outcome {
                AttemptOutcome::Succeeded { output_key } => {
                    break JobResult::success(run_id, &request.sku, output_key);
                }
                AttemptOutcome::Rejected { reason } => {
                    self.publish_failed(&request, attempt, &reason);
                    break self
                        .dead_letter(&request, scope, reason, attempt)
                        .await?;
                }
                AttemptOutcome::Failed { error } => {
                    self.publish_failed(&request, attempt, &error);

                    match process_failure(attempt, &self.retry) {
                        FailureDisposition::Retry { delay_ms } => {
                            info!(
                                sku = %request.sku,
                                attempt,
                                delay_ms,
                                error = %error,
                                "render attempt failed, retrying"
                            );
                            self.events.publish_event(WorkflowEvent::new(
                                run_id,
                                WorkflowEventPayload::JobRetryScheduled {
                                    sku: request.sku.clone(),
                                    attempt: attempt + 1,
                                    delay_ms,
                                },
                            ));
                            if !run.replayed {
                                tokio::select! {
                                    _ = self.shutdown.cancelled() => bail!("shutdown requested"),
                                    _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {}
                                }
                            }
                            attempt += 1;
                        }
                        FailureDisposition::DeadLetter => {
                            break self
                                .dead_letter(&request, scope, error, attempt)
                                .await?;
                        }
                    }
                }
            }
        };

        let result = self.emit_result(scope, result).await?;
        telemetry::record_job_end(timing, run_id, result.status.as_str());
        Ok(result)
    }

    fn publish_failed(&self, request: &JobRequest, attempt: u32, error: &str) {
        self.events.publish_event(WorkflowEvent::new(
            request.run_id,
            WorkflowEventPayload::JobFailed {
                sku: request.sku.clone(),
                attempt,
                error: error.to_string(),
            },
        ));
    }

    async fn dead_letter(
        &self,
        request: &JobRequest,
        scope: &str,
        reason: String,
        attempts: u32,
    ) -> anyhow::Result<JobResult> {
        let run_id = request.run_id;
        let step = steps::dead_letter(scope, &request.sku);
        let entry = DeadLetterEntry::new(request.clone(), reason, attempts);

        let write = self
            .log
            .record_intent(run_id, &step, serde_json::to_value(&entry)?)
            .await?;
        let entry: DeadLetterEntry = write.record().intent_as()?;

        if !write.record().is_done() {
            self.dead_letters.dead_letter(entry.clone()).await?;
            self.log
                .complete_step(run_id, &step, Some(json!({ "entryId": entry.id })))
                .await?;

            telemetry::record_job_dead_lettered(run_id, &request.sku, &entry.reason);
            self.events.publish_event(WorkflowEvent::new(
                run_id,
                WorkflowEventPayload::JobDeadLettered {
                    sku: request.sku.clone(),
                    entry_id: entry.id,
                    reason: entry.reason.clone(),
                },
            ));
        }

        Ok(JobResult::failure(run_id, &request.sku, entry.reason))
    }

    async fn emit_result(
        &self,
        scope: &str,
        result: JobResult,
    ) -> anyhow::Result<JobResult> {
        let run_id = result.run_id;
        let step = steps::result(scope, &result.sku);

        let write = self
            .log
            .record_intent(run_id, &step, serde_json::to_value(&result)?)
            .await?;
        let replayed = write.record().is_done();
        let result: JobResult = write.record().intent_as()?;

        let delivery = self.router.deliver(result.clone()).await;
        if delivery == Delivery::Closed {
            let reason = DiscardReason::LateArrival;
            telemetry::record_result_discarded(run_id, &result.sku, reason.as_str());
            self.events.publish_event(WorkflowEvent::new(
                run_id,
                WorkflowEventPayload::ResultDiscarded {
                    sku: result.sku.clone(),
                    reason,
                },
            ));
        }

        self.log
            .complete_step(
                run_id,
                &step,
                Some(json!({ "routed": delivery == Delivery::Routed })),
            )
            .await?;

        if replayed {
            return Ok(result);
        }
        if let Some(output_key) = result.output_key.as_ref().filter(|_| result.is_success()) {
            self.events.publish_event(WorkflowEvent::new(
                run_id,
                WorkflowEventPayload::JobSucceeded {
                    sku: result.sku.clone(),
                    output_key: output_key.clone(),
                },
            ));
        }

        Ok(result)
    }
}
