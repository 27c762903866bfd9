use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::job::{RunId, RunStatus, WorkflowRun};
use crate::steplog::{AdmitOutcome, StepLog, StepRecord, StepWrite};

const SCHEMA: &str = include_str!("../../migrations/001_step_log.sql");

const RUN_COLUMNS: &str = "run_id, revision_id, resource_id, spreadsheet_id, \
     total_jobs, invalid_rows_count, status, created_at, updated_at";

const STEP_COLUMNS: &str =
    "run_id, step, state, intent, outcome, recorded_at, completed_at";

/// PostgreSQL-backed step log.
///
/// Runs are unique per revision id and steps per `(run_id, step)`; every
/// write is an `INSERT .. ON CONFLICT DO NOTHING` followed by a read of the
/// winning row, so concurrent writers agree on a single record.
#[derive(Clone, Debug)]
pub struct PostgresStepLog {
    pool: PgPool,
}

impl PostgresStepLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await
            .context("connecting to the step log database")?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the step log tables if they do not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("applying step log schema")?;
        Ok(())
    }

    fn row_to_run(row: &PgRow) -> anyhow::Result<WorkflowRun> {
        let status: String = row.try_get("status")?;
        let total_jobs: Option<i64> = row.try_get("total_jobs")?;
        let invalid_rows_count: Option<i64> = row.try_get("invalid_rows_count")?;

        Ok(WorkflowRun {
            run_id: RunId(row.try_get("run_id")?),
            revision_id: row.try_get("revision_id")?,
            resource_id: row.try_get("resource_id")?,
            spreadsheet_id: row.try_get("spreadsheet_id")?,
            total_jobs: total_jobs.map(usize::try_from).transpose()?,
            invalid_rows_count: invalid_rows_count
                .map(usize::try_from)
                .transpose()?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_step(row: &PgRow) -> anyhow::Result<StepRecord> {
        let state: String = row.try_get("state")?;
        let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;

        Ok(StepRecord {
            run_id: RunId(row.try_get("run_id")?),
            step: row.try_get("step")?,
            state: state.parse()?,
            intent: row.try_get("intent")?,
            outcome: row.try_get("outcome")?,
            recorded_at,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn fetch_step(
        &self,
        run_id: RunId,
        step: &str,
    ) -> anyhow::Result<Option<StepRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM forge_steps WHERE run_id = $1 AND step = $2"
        ))
        .bind(run_id.as_uuid())
        .bind(step)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_step).transpose()
    }
}

#[async_trait]
impl StepLog for PostgresStepLog {
    async fn admit(&self, run: WorkflowRun) -> anyhow::Result<AdmitOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO forge_runs (
                run_id, revision_id, resource_id, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(run.run_id.as_uuid())
        .bind(&run.revision_id)
        .bind(&run.resource_id)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(AdmitOutcome { run, created: true });
        }

        let existing = self
            .run_for_revision(&run.revision_id)
            .await?
            .ok_or_else(|| {
                anyhow!("run for revision {} vanished after conflict", run.revision_id)
            })?;
        debug!(run_id = %existing.run_id, "revision already admitted");
        Ok(AdmitOutcome {
            run: existing,
            created: false,
        })
    }

    async fn run(&self, run_id: RunId) -> anyhow::Result<Option<WorkflowRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM forge_runs WHERE run_id = $1"
        ))
        .bind(run_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn run_for_revision(
        &self,
        revision_id: &str,
    ) -> anyhow::Result<Option<WorkflowRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM forge_runs WHERE revision_id = $1"
        ))
        .bind(revision_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn runs_with_status(
        &self,
        status: RunStatus,
    ) -> anyhow::Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM forge_runs WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    async fn set_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
    ) -> anyhow::Result<()> {
        let updated = sqlx::query(
            "UPDATE forge_runs SET status = $2, updated_at = NOW() WHERE run_id = $1",
        )
        .bind(run_id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(anyhow!("run {} not found", run_id));
        }
        Ok(())
    }

    async fn set_run_totals(
        &self,
        run_id: RunId,
        spreadsheet_id: &str,
        total_jobs: usize,
        invalid_rows_count: usize,
    ) -> anyhow::Result<()> {
        let exists = sqlx::query(
            r#"
            UPDATE forge_runs
            SET spreadsheet_id = COALESCE(spreadsheet_id, $2),
                total_jobs = COALESCE(total_jobs, $3),
                invalid_rows_count = COALESCE(invalid_rows_count, $4),
                updated_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(spreadsheet_id)
        .bind(i64::try_from(total_jobs)?)
        .bind(i64::try_from(invalid_rows_count)?)
        .execute(&self.pool)
        .await?;

        if exists.rows_affected() == 0 {
            return Err(anyhow!("run {} not found", run_id));
        }
        Ok(())
    }

    async fn record_intent(
        &self,
        run_id: RunId,
        step: &str,
        intent: serde_json::Value,
    ) -> anyhow::Result<StepWrite> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO forge_steps (run_id, step, state, intent, recorded_at)
            VALUES ($1, $2, 'intent', $3, NOW())
            ON CONFLICT (run_id, step) DO NOTHING
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(step)
        .bind(&intent)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(StepWrite::Inserted(Self::row_to_step(&row)?));
        }

        let existing = self.fetch_step(run_id, step).await?.ok_or_else(|| {
            anyhow!("step {} of run {} vanished after conflict", step, run_id)
        })?;
        Ok(StepWrite::Existing(existing))
    }

    async fn complete_step(
        &self,
        run_id: RunId,
        step: &str,
        outcome: Option<serde_json::Value>,
    ) -> anyhow::Result<StepRecord> {
        sqlx::query(
            r#"
            UPDATE forge_steps
            SET state = 'done', outcome = $3, completed_at = NOW()
            WHERE run_id = $1 AND step = $2 AND state = 'intent'
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(step)
        .bind(&outcome)
        .execute(&self.pool)
        .await?;

        self.fetch_step(run_id, step).await?.ok_or_else(|| {
            anyhow!("step {} of run {} has no recorded intent", step, run_id)
        })
    }

    async fn step(
        &self,
        run_id: RunId,
        step: &str,
    ) -> anyhow::Result<Option<StepRecord>> {
        self.fetch_step(run_id, step).await
    }

    async fn steps_for_run(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Vec<StepRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM forge_steps WHERE run_id = $1 ORDER BY seq ASC"
        ))
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_step).collect()
    }
}
