use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::client::ReportDelivery;
use crate::events::{DiscardReason, InProcEventBus, WorkflowEvent, WorkflowEventPayload};
use crate::job::{AggregationRequest, JobRequest, JobResult, RunId, RunStatus};
use crate::report::AggregatedReport;
use crate::router::{ResultRouter, ResultSubscription};
use crate::steplog::{steps, StepLog};
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Results accepted so far for one run. The seen set only grows.
#[derive(Debug, Default)]
struct Collected {
    seen: HashSet<String>,
    successful: Vec<JobResult>,
    failed: Vec<JobResult>,
}

impl Collected {
    fn accept(&mut self, result: JobResult) {
        if !self.seen.insert(result.sku.clone()) {
            return;
        }
        if result.is_success() {
            self.successful.push(result);
        } else {
            self.failed.push(result);
        }
    }
}

enum Wake {
    Shutdown,
    Deadline,
    Result(Option<JobResult>),
}

/// Collects the results of a run into one report, exactly once.
#[derive(Clone)]
pub struct FanInAggregator {
    log: Arc<dyn StepLog>,
    router: ResultRouter,
    delivery: Arc<dyn ReportDelivery>,
    events: Arc<InProcEventBus>,
    timeout: Duration,
    shutdown: ShutdownToken,
}

impl FanInAggregator {
    pub fn new(
        log: Arc<dyn StepLog>,
        router: ResultRouter,
        delivery: Arc<dyn ReportDelivery>,
        events: Arc<InProcEventBus>,
        timeout: Duration,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            log,
            router,
            delivery,
            events,
            timeout,
            shutdown,
        }
    }

    /// Wait for `request.total_jobs` distinct results or the deadline,
    /// then finalize the report.
    ///
    /// Results already recorded for the run are restored first, so a resumed
    /// aggregation keeps counting where the previous one stopped. Without a
    /// subscription only restored results are counted.
    pub async fn aggregate(
        &self,
        request: &AggregationRequest,
        subscription: Option<ResultSubscription>,
    ) -> anyhow::Result<AggregatedReport> {
        self.aggregate_inner(request, subscription)
            .instrument(telemetry::aggregate_span(request.run_id, request.total_jobs))
            .await
    }

    async fn aggregate_inner(
        &self,
        request: &AggregationRequest,
        mut subscription: Option<ResultSubscription>,
    ) -> anyhow::Result<AggregatedReport> {
        let run_id = request.run_id;

        if let Some(record) = self.log.step(run_id, steps::AGGREGATE_FINALIZE).await? {
            return self.finalize(record.intent_as()?).await;
        }

        let started = self
            .log
            .record_intent(run_id, steps::AGGREGATE_REQUEST, serde_json::to_value(request)?)
            .await?;
        let elapsed = (Utc::now() - started.record().recorded_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + self.timeout.saturating_sub(elapsed);

        let (expected, mut collected) = self.restore(run_id).await?;
        if !collected.seen.is_empty() {
            info!(
                run_id = %run_id,
                restored = collected.seen.len(),
                "restored recorded results"
            );
        }

        let complete = loop {
            if collected.seen.len() >= request.total_jobs {
                break true;
            }

            let next = async {
                match subscription.as_mut() {
                    Some(subscription) => subscription.recv().await,
                    None => std::future::pending().await,
                }
            };

            let wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                result = next => Wake::Result(result),
            };

            match wake {
                Wake::Shutdown => bail!("shutdown while aggregating run {}", run_id),
                Wake::Deadline => {
                    warn!(
                        run_id = %run_id,
                        received = collected.seen.len(),
                        expected = request.total_jobs,
                        "aggregation timed out"
                    );
                    break false;
                }
                Wake::Result(Some(result)) => {
                    self.consider(run_id, &expected, &mut collected, result)
                        .await?;
                }
                Wake::Result(None) => {
                    debug!(run_id = %run_id, "result channel closed, waiting for deadline");
                    subscription = None;
                }
            }
        };

        let report = AggregatedReport {
            run_id,
            spreadsheet_id: request.spreadsheet_id.clone(),
            successful_jobs: collected.successful,
            failed_jobs: collected.failed,
            invalid_rows_count: request.invalid_rows_count,
            expected_jobs: request.total_jobs,
            complete,
        };
        self.finalize(report).await
    }

    /// Finalize the report of a run that emitted no jobs.
    pub async fn finalize_empty(
        &self,
        run_id: RunId,
        spreadsheet_id: &str,
        invalid_rows_count: usize,
    ) -> anyhow::Result<AggregatedReport> {
        self.finalize(AggregatedReport::empty(
            run_id,
            spreadsheet_id,
            invalid_rows_count,
        ))
        .await
    }

    async fn restore(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<(HashSet<String>, Collected)> {
        let mut expected = HashSet::new();
        let mut collected = Collected::default();

        for record in self.log.steps_for_run(run_id).await? {
            if record.step.starts_with(steps::REQUEST_PREFIX) {
                let request: JobRequest = record.intent_as()?;
                expected.insert(request.sku);
            } else if record.step.starts_with(steps::AGGREGATE_RESULT_PREFIX) {
                collected.accept(record.intent_as()?);
            }
        }

        Ok((expected, collected))
    }

    async fn consider(
        &self,
        run_id: RunId,
        expected: &HashSet<String>,
        collected: &mut Collected,
        result: JobResult,
    ) -> anyhow::Result<()> {
        if result.run_id != run_id {
            self.discard(run_id, &result.sku, DiscardReason::WrongRun);
            return Ok(());
        }
        if !expected.is_empty() && !expected.contains(&result.sku) {
            self.discard(run_id, &result.sku, DiscardReason::UnknownSku);
            return Ok(());
        }
        if collected.seen.contains(&result.sku) {
            self.discard(run_id, &result.sku, DiscardReason::Duplicate);
            return Ok(());
        }

        let step = steps::aggregate_result(&result.sku);
        let write = self
            .log
            .record_intent(run_id, &step, serde_json::to_value(&result)?)
            .await?;
        if !write.inserted() {
            debug!(run_id = %run_id, sku = %result.sku, "result already recorded");
        }
        let stored: JobResult = write.record().intent_as()?;
        self.log.complete_step(run_id, &step, None).await?;

        debug!(
            run_id = %run_id,
            sku = %stored.sku,
            status = %stored.status,
            "result accepted"
        );
        collected.accept(stored);
        Ok(())
    }

    fn discard(&self, run_id: RunId, sku: &str, reason: DiscardReason) {
        telemetry::record_result_discarded(run_id, sku, reason.as_str());
        self.events.publish_event(WorkflowEvent::new(
            run_id,
            WorkflowEventPayload::ResultDiscarded {
                sku: sku.to_string(),
                reason,
            },
        ));
    }

    /// Guarded by the finalize step: the first recorded report wins and its
    /// side effects run at most once per completed step.
    async fn finalize(
        &self,
        report: AggregatedReport,
    ) -> anyhow::Result<AggregatedReport> {
        let run_id = report.run_id;
        let write = self
            .log
            .record_intent(
                run_id,
                steps::AGGREGATE_FINALIZE,
                serde_json::to_value(&report)?,
            )
            .await?;
        let report: AggregatedReport = write.record().intent_as()?;
        if write.record().is_done() {
            return Ok(report);
        }

        self.router.close(run_id).await;

        let delivered = match self.delivery.deliver(&report).await {
            Ok(()) => true,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "report delivery failed");
                false
            }
        };

        let status = if report.complete {
            RunStatus::Completed
        } else {
            RunStatus::TimedOut
        };
        self.log.set_run_status(run_id, status).await?;
        self.log
            .complete_step(
                run_id,
                steps::AGGREGATE_FINALIZE,
                Some(json!({ "delivered": delivered, "status": status })),
            )
            .await?;

        telemetry::record_run_finalized(
            run_id,
            status.as_str(),
            report.successful_jobs.len(),
            report.failed_jobs.len(),
        );
        self.events.publish_event(WorkflowEvent::new(
            run_id,
            WorkflowEventPayload::RunFinalized {
                status,
                successful: report.successful_jobs.len(),
                failed: report.failed_jobs.len(),
                complete: report.complete,
            },
        ));

        Ok(report)
    }
}
