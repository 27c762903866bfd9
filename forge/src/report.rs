use serde::{Deserialize, Serialize};

use crate::job::{JobResult, RunId};

/// Summary of a finalized run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedReport {
    pub run_id: RunId,
    pub spreadsheet_id: String,
    pub successful_jobs: Vec<JobResult>,
    pub failed_jobs: Vec<JobResult>,
    pub invalid_rows_count: usize,
    pub expected_jobs: usize,
    /// False when the report was finalized by the aggregation timeout.
    pub complete: bool,
}

impl AggregatedReport {
    /// Report for a run that produced no jobs.
    pub fn empty(
        run_id: RunId,
        spreadsheet_id: impl Into<String>,
        invalid_rows_count: usize,
    ) -> Self {
        Self {
            run_id,
            spreadsheet_id: spreadsheet_id.into(),
            successful_jobs: Vec::new(),
            failed_jobs: Vec::new(),
            invalid_rows_count,
            expected_jobs: 0,
            complete: true,
        }
    }

    pub fn received(&self) -> usize {
        self.successful_jobs.len() + self.failed_jobs.len()
    }

    pub fn successful_skus(&self) -> Vec<&str> {
        self.successful_jobs.iter().map(|r| r.sku.as_str()).collect()
    }

    pub fn failed_skus(&self) -> Vec<&str> {
        self.failed_jobs.iter().map(|r| r.sku.as_str()).collect()
    }

    /// Human readable summary suitable for a chat notification.
    pub fn summary_text(&self) -> String {
        let mut text = format!(
            "Poster generation report for spreadsheet {}\n\
             Successful posters: {}\n\
             Failed posters: {}\n\
             Skipped invalid rows: {}\n",
            self.spreadsheet_id,
            self.successful_jobs.len(),
            self.failed_jobs.len(),
            self.invalid_rows_count,
        );

        if !self.failed_jobs.is_empty() {
            text.push_str(&format!(
                "Failed SKUs: {}\n",
                self.failed_skus().join(", ")
            ));
        }

        if !self.complete {
            text.push_str(&format!(
                "Incomplete: received {} of {} results before the timeout\n",
                self.received(),
                self.expected_jobs
            ));
        }

        text
    }
}
