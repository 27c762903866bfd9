use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use crate::client::ReadOutcome;
use crate::events::{InProcEventBus, WorkflowEvent, WorkflowEventPayload};
use crate::job::{AggregationRequest, JobRequest, RowRecord, RunId};
use crate::steplog::{steps, StepLog};
use crate::telemetry;

/// Receives the requests produced by a fan-out.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn emit_job(&self, request: JobRequest) -> anyhow::Result<()>;

    /// Called once, after every job of the run has been emitted.
    async fn emit_aggregation(
        &self,
        request: AggregationRequest,
    ) -> anyhow::Result<()>;
}

/// Rows and totals of a fan-out, recorded as the intent of the `fan-out`
/// step. A resumed fan-out emits from the plan alone, whatever the source
/// holds by then.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutPlan {
    pub spreadsheet_id: String,
    /// One row per distinct sku, in emission order.
    pub rows: Vec<RowRecord>,
    /// Invalid rows reported by the reader plus duplicate skus.
    pub invalid_rows_count: usize,
    pub duplicate_rows: usize,
}

impl FanOutPlan {
    /// Deduplicate rows by sku, first occurrence wins.
    pub fn from_rows(rows: &ReadOutcome) -> Self {
        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(rows.valid_rows.len());
        let mut duplicate_rows = 0;

        for row in &rows.valid_rows {
            if seen.insert(row.sku.as_str()) {
                planned.push(row.clone());
            } else {
                warn!(sku = %row.sku, "duplicate sku in source rows, counting as invalid");
                duplicate_rows += 1;
            }
        }

        Self {
            spreadsheet_id: rows.spreadsheet_id.clone(),
            rows: planned,
            invalid_rows_count: rows.invalid_rows_count + duplicate_rows,
            duplicate_rows,
        }
    }

    pub fn total_jobs(&self) -> usize {
        self.rows.len()
    }

    pub fn skus(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|row| row.sku.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FanOutSummary {
    pub run_id: RunId,
    pub spreadsheet_id: String,
    pub total_jobs: usize,
    pub invalid_rows_count: usize,
    pub duplicate_rows: usize,
    /// `None` when the run has no jobs.
    pub aggregation: Option<AggregationRequest>,
}

impl FanOutSummary {
    /// With no jobs there is nothing to wait for: the empty report must be
    /// finalized right away.
    pub fn requires_empty_report(&self) -> bool {
        self.total_jobs == 0
    }
}

/// Turns the rows of one revision into job requests and a single
/// aggregation request.
#[derive(Clone)]
pub struct FanOutCoordinator {
    log: Arc<dyn StepLog>,
    events: Arc<InProcEventBus>,
}

impl FanOutCoordinator {
    pub fn new(log: Arc<dyn StepLog>, events: Arc<InProcEventBus>) -> Self {
        Self { log, events }
    }

    /// Emit one request per distinct sku, then the aggregation request.
    ///
    /// Replaying a fan-out for the same run re-emits the recorded requests;
    /// the recorded plan wins over freshly read rows.
    pub async fn fan_out(
        &self,
        run_id: RunId,
        rows: ReadOutcome,
        sink: &dyn JobSink,
    ) -> anyhow::Result<FanOutSummary> {
        self.fan_out_inner(run_id, rows, sink)
            .instrument(telemetry::fan_out_span(run_id))
            .await
    }

    async fn fan_out_inner(
        &self,
        run_id: RunId,
        rows: ReadOutcome,
        sink: &dyn JobSink,
    ) -> anyhow::Result<FanOutSummary> {
        let fresh_plan = FanOutPlan::from_rows(&rows);

        let write = self
            .log
            .record_intent(run_id, steps::FAN_OUT, serde_json::to_value(&fresh_plan)?)
            .await
            .context("recording fan-out intent")?;
        let replay = !write.inserted();
        let plan: FanOutPlan = write.record().intent_as()?;

        info!(
            run_id = %run_id,
            total_jobs = plan.total_jobs(),
            invalid_rows = plan.invalid_rows_count,
            replay,
            "fanning out"
        );

        for row in &plan.rows {
            let request = self.record_request(run_id, &plan, row).await?;
            sink.emit_job(request)
                .await
                .with_context(|| format!("emitting job for sku {}", row.sku))?;

            telemetry::record_job_emitted(run_id, &row.sku);
            self.events.publish_event(WorkflowEvent::new(
                run_id,
                WorkflowEventPayload::JobEmitted {
                    sku: row.sku.clone(),
                },
            ));
        }

        self.log
            .set_run_totals(
                run_id,
                &plan.spreadsheet_id,
                plan.total_jobs(),
                plan.invalid_rows_count,
            )
            .await?;

        let aggregation = if plan.total_jobs() == 0 {
            None
        } else {
            let request = AggregationRequest {
                run_id,
                total_jobs: plan.total_jobs(),
                invalid_rows_count: plan.invalid_rows_count,
                spreadsheet_id: plan.spreadsheet_id.clone(),
            };
            let recorded: AggregationRequest = self
                .log
                .record_intent(
                    run_id,
                    steps::AGGREGATE_REQUEST,
                    serde_json::to_value(&request)?,
                )
                .await?
                .record()
                .intent_as()?;
            sink.emit_aggregation(recorded.clone())
                .await
                .context("emitting aggregation request")?;
            Some(recorded)
        };

        self.log
            .complete_step(
                run_id,
                steps::FAN_OUT,
                Some(serde_json::json!({ "emitted": plan.total_jobs() })),
            )
            .await?;

        Ok(FanOutSummary {
            run_id,
            total_jobs: plan.total_jobs(),
            spreadsheet_id: plan.spreadsheet_id,
            invalid_rows_count: plan.invalid_rows_count,
            duplicate_rows: plan.duplicate_rows,
            aggregation,
        })
    }

    async fn record_request(
        &self,
        run_id: RunId,
        plan: &FanOutPlan,
        row: &RowRecord,
    ) -> anyhow::Result<JobRequest> {
        let request = JobRequest {
            run_id,
            sku: row.sku.clone(),
            row_data: row.data.clone(),
            spreadsheet_id: plan.spreadsheet_id.clone(),
        };

        self.log
            .record_intent(
                run_id,
                &steps::request(&row.sku),
                serde_json::to_value(&request)?,
            )
            .await?
            .record()
            .intent_as()
    }

    /// Rebuild the rows of a started fan-out from its recorded plan, so
    /// recovery never reads the source again.
    pub async fn recorded_rows(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Option<ReadOutcome>> {
        let Some(record) = self.log.step(run_id, steps::FAN_OUT).await? else {
            return Ok(None);
        };

        let plan: FanOutPlan = record.intent_as()?;
        Ok(Some(ReadOutcome {
            valid_rows: plan.rows,
            invalid_rows_count: plan.invalid_rows_count - plan.duplicate_rows,
            spreadsheet_id: plan.spreadsheet_id,
        }))
    }
}
