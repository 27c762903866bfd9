//! Local pipeline example with a simulated render API.
//!
//! Reads an in-memory sheet grid, renders every valid row through a render
//! client that finishes after a few polls, and prints the aggregated report.
//! Rows whose sku starts with `BAD` fail to render and end up dead-lettered.
//!
//! Run with: `cargo run --example local_pipeline`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use forge::rows::{read_grid, RequiredFieldsValidator};
use forge::*;
use tokio::sync::Mutex;

/// Row reader over a fixed grid, header first.
struct GridReader {
    values: Vec<Vec<String>>,
}

#[async_trait]
impl RowReader for GridReader {
    async fn read_rows(&self, trigger: &TriggerEvent) -> Result<ReadOutcome, ReadError> {
        let validator = RequiredFieldsValidator::new(["sku", "title"]);
        Ok(read_grid(&self.values, &validator, trigger.resource_id.clone()))
    }
}

/// Render API stand-in: every job reports `running` twice, then finishes.
#[derive(Default)]
struct SimulatedRenderClient {
    jobs: Mutex<HashMap<String, (String, u32)>>,
}

#[async_trait]
impl RenderClient for SimulatedRenderClient {
    async fn submit(&self, request: &JobRequest) -> Result<Submission, SubmitError> {
        let url = format!("local://render/{}/{}", request.run_id, request.sku);
        self.jobs
            .lock()
            .await
            .insert(url.clone(), (request.sku.clone(), 0));
        println!("[RENDER] accepted {}", request.sku);

        Ok(Submission {
            job_status_url: url,
            output_key: None,
        })
    }

    async fn poll(&self, job_status_url: &str) -> Result<PollStatus, PollError> {
        let mut jobs = self.jobs.lock().await;
        let (sku, polls) = jobs
            .get_mut(job_status_url)
            .ok_or_else(|| PollError::Fatal(format!("unknown job {}", job_status_url)))?;
        *polls += 1;

        if *polls < 3 {
            return Ok(PollStatus::new(PollStatus::RUNNING));
        }
        if sku.starts_with("BAD") {
            return Ok(PollStatus::new("failed").with_error("template rendering failed"));
        }
        println!("[RENDER] finished {}", sku);
        Ok(PollStatus::new(PollStatus::SUCCEEDED))
    }
}

fn sheet() -> Vec<Vec<String>> {
    [
        ["sku", "title", "is_active"],
        ["P-100", "Autumn sale", "TRUE"],
        ["P-101", "Winter sale", "true"],
        ["BAD-1", "Broken template", "TRUE"],
        ["", "Row without a sku", "TRUE"],
        ["P-102", "", "FALSE"],
        ["P-103", "Spring sale", "no"],
    ]
    .iter()
    .map(|row| row.iter().map(|cell| cell.to_string()).collect())
    .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AppConfig::default();
    config.render.poll_interval_ms = 200;
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 100;
    logging::init_tracing(&config.logging)?;

    let runtime = WorkflowRuntimeBuilder::new(config)
        .with_row_reader(Arc::new(GridReader { values: sheet() }))
        .with_render_client(Arc::new(SimulatedRenderClient::default()))
        .with_report_delivery(Arc::new(LogReportDelivery))
        .build()?;

    let admission = runtime
        .handle_trigger(&TriggerEvent::new("local-sheet", "rev-1"))
        .await?;
    println!("[MAIN] admitted run {}", admission.run_id);

    let again = runtime
        .handle_trigger(&TriggerEvent::new("local-sheet", "rev-1"))
        .await?;
    println!("[MAIN] second trigger admitted: {}", again.admitted);

    let report = runtime.await_run(admission.run_id).await?;
    println!("\n{}", report.summary_text());

    for entry in runtime.dead_letters().await? {
        println!(
            "[MAIN] dead-lettered {} after {} attempts: {}",
            entry.request.sku, entry.attempts, entry.reason
        );
    }

    runtime.shutdown().await?;
    Ok(())
}
