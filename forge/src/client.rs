use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DeliveryError, PollError, ReadError, SubmitError};
use crate::job::{JobRequest, RowRecord, TriggerEvent};
use crate::report::AggregatedReport;

/// Rows read from the source document for one revision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOutcome {
    pub valid_rows: Vec<RowRecord>,
    pub invalid_rows_count: usize,
    pub spreadsheet_id: String,
}

/// Accepted submission returned by the render API.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub job_status_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PollErrorDetail {
    pub title: String,
}

/// Status document returned when polling a render job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PollStatus {
    pub status: String,
    #[serde(default)]
    pub errors: Vec<PollErrorDetail>,
}

impl PollStatus {
    pub const RUNNING: &'static str = "running";
    pub const UNSTARTED: &'static str = "unstarted";
    pub const SUCCEEDED: &'static str = "succeeded";

    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            errors: Vec::new(),
        }
    }

    pub fn with_error(mut self, title: impl Into<String>) -> Self {
        self.errors.push(PollErrorDetail {
            title: title.into(),
        });
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == Self::RUNNING || self.status == Self::UNSTARTED
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == Self::SUCCEEDED
    }

    /// Failure message for a terminal non-success status.
    pub fn failure_message(&self) -> String {
        match self.errors.first() {
            Some(detail) => detail.title.clone(),
            None => format!("render job finished with status {}", self.status),
        }
    }
}

/// Reads and validates the rows of the source document.
#[async_trait]
pub trait RowReader: Send + Sync {
    async fn read_rows(
        &self,
        trigger: &TriggerEvent,
    ) -> Result<ReadOutcome, ReadError>;
}

/// Client of the external render API.
#[async_trait]
pub trait RenderClient: Send + Sync {
    async fn submit(&self, request: &JobRequest) -> Result<Submission, SubmitError>;

    async fn poll(&self, job_status_url: &str) -> Result<PollStatus, PollError>;
}

/// Delivers finalized reports to people.
#[async_trait]
pub trait ReportDelivery: Send + Sync {
    async fn deliver(&self, report: &AggregatedReport) -> Result<(), DeliveryError>;
}

/// Report delivery that only writes the summary to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReportDelivery;

#[async_trait]
impl ReportDelivery for LogReportDelivery {
    async fn deliver(&self, report: &AggregatedReport) -> Result<(), DeliveryError> {
        info!(
            run_id = %report.run_id,
            successful = report.successful_jobs.len(),
            failed = report.failed_jobs.len(),
            complete = report.complete,
            "{}",
            report.summary_text()
        );
        Ok(())
    }
}
