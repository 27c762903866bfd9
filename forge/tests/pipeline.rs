//! End-to-end pipeline tests: admission, fan-out, render, fan-in.
//!
//! Every test runs on a paused clock, so poll intervals, retry backoff and
//! the aggregation deadline elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use forge::steplog::steps;
use forge::*;
use forge_testkit::{
    fast_config, grid, PollStep, RecordingReportSink, ScriptedAttempt,
    ScriptedRenderClient, StaticRowReader,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);

fn runtime(
    config: AppConfig,
    reader: &StaticRowReader,
    client: &ScriptedRenderClient,
    sink: &RecordingReportSink,
) -> WorkflowRuntime {
    WorkflowRuntimeBuilder::new(config)
        .with_row_reader(Arc::new(reader.clone()))
        .with_render_client(Arc::new(client.clone()))
        .with_report_delivery(Arc::new(sink.clone()))
        .build()
        .expect("runtime builds")
}

fn sorted(mut skus: Vec<&str>) -> Vec<&str> {
    skus.sort_unstable();
    skus
}

async fn run_to_report(
    runtime: &WorkflowRuntime,
    revision: &str,
) -> (Admission, AggregatedReport) {
    let admission = runtime
        .handle_trigger(&TriggerEvent::new("sheet-doc", revision))
        .await
        .expect("trigger admitted");
    let report = timeout(WAIT, runtime.await_run(admission.run_id))
        .await
        .expect("run finished in time")
        .expect("run produced a report");
    (admission, report)
}

#[tokio::test(start_paused = true)]
async fn test_three_rows_partition_into_report() {
    let reader = StaticRowReader::with_rows("sheet-1", &["A", "B", "C"], 1);
    let client = ScriptedRenderClient::new();
    client
        .push_attempt("B", ScriptedAttempt::failing("render error"))
        .push_attempt("B", ScriptedAttempt::failing("render error"));
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);

    let (admission, report) = run_to_report(&runtime, "rev-1").await;

    assert!(admission.admitted);
    assert!(report.complete);
    assert_eq!(sorted(report.successful_skus()), vec!["A", "C"]);
    assert_eq!(report.failed_skus(), vec!["B"]);
    assert_eq!(report.failed_jobs[0].error.as_deref(), Some("render error"));
    assert_eq!(report.invalid_rows_count, 1);
    assert_eq!(report.expected_jobs, 3);
    assert!(report
        .successful_jobs
        .iter()
        .all(|r| r.output_key.as_deref() == Some(&*default_output_key(&r.sku))));

    sink.assert_report_count_eq(1);
    assert_eq!(client.submit_count("B"), 2);

    let run = runtime
        .step_log()
        .run(admission.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_jobs, Some(3));
    assert_eq!(run.invalid_rows_count, Some(1));

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_zero_rows_finalize_an_empty_report() {
    let reader = StaticRowReader::with_rows("sheet-1", &[], 3);
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);

    let (admission, report) = run_to_report(&runtime, "rev-empty").await;

    assert!(report.complete);
    assert!(report.successful_jobs.is_empty());
    assert!(report.failed_jobs.is_empty());
    assert_eq!(report.invalid_rows_count, 3);
    assert_eq!(client.total_submits(), 0);
    sink.assert_report_count_eq(1);

    let log = runtime.step_log();
    assert!(log
        .step(admission.run_id, steps::AGGREGATE_REQUEST)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        log.run(admission.run_id).await.unwrap().unwrap().status,
        RunStatus::Completed
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_readmitting_a_revision_starts_nothing_new() {
    let reader = StaticRowReader::with_rows("sheet-1", &["A", "B"], 0);
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);

    let (first, _) = run_to_report(&runtime, "rev-1").await;
    let again = runtime
        .handle_trigger(&TriggerEvent::new("sheet-doc", " rev-1 "))
        .await
        .unwrap();

    assert!(!again.admitted);
    assert_eq!(again.run_id, first.run_id);

    let report = runtime.await_run(again.run_id).await.unwrap();
    assert!(report.complete);
    assert_eq!(reader.read_count(), 1);
    assert_eq!(client.total_submits(), 2);
    sink.assert_report_count_eq(1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_jobs_never_exceed_the_limit() {
    let skus: Vec<String> = (0..12).map(|i| format!("SKU-{i:02}")).collect();
    let sku_refs: Vec<&str> = skus.iter().map(String::as_str).collect();
    let reader = StaticRowReader::with_rows("sheet-1", &sku_refs, 0);

    let client = ScriptedRenderClient::new();
    for sku in &skus {
        client.push_attempt(
            sku.as_str(),
            ScriptedAttempt::accepted([
                PollStep::Pending,
                PollStep::Pending,
                PollStep::Pending,
                PollStep::Succeeded,
            ]),
        );
    }
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(3), &reader, &client, &sink);

    let (_, report) = run_to_report(&runtime, "rev-busy").await;

    assert!(report.complete);
    assert_eq!(report.successful_jobs.len(), 12);
    client.assert_max_in_flight_le(3);
    assert_eq!(client.max_in_flight(), 3);
    assert_eq!(runtime.budget().utilization().await.unwrap(), (0, 3));

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_results_time_out_with_partial_report() {
    let reader = StaticRowReader::with_rows("sheet-1", &["A", "B", "C"], 2);
    let client = ScriptedRenderClient::new();
    client.push_attempt("B", ScriptedAttempt::accepted([PollStep::Pending]));
    let sink = RecordingReportSink::new();

    let mut config = fast_config(3);
    config.aggregation.timeout_secs = 5;
    let runtime = runtime(config, &reader, &client, &sink);

    let (admission, report) = run_to_report(&runtime, "rev-slow").await;

    assert!(!report.complete);
    assert_eq!(sorted(report.successful_skus()), vec!["A", "C"]);
    assert!(report.failed_jobs.is_empty());
    assert_eq!(report.invalid_rows_count, 2);
    assert!(report.summary_text().contains("received 2 of 3"));
    assert_eq!(
        runtime
            .step_log()
            .run(admission.run_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        RunStatus::TimedOut
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_job_is_dead_lettered_and_redriven() {
    let reader = StaticRowReader::with_rows("sheet-1", &["A", "B"], 0);
    let client = ScriptedRenderClient::new();
    client.push_attempt("A", ScriptedAttempt::rejected("quota exceeded"));
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);
    let mut events = runtime.events();

    let (admission, report) = run_to_report(&runtime, "rev-1").await;

    assert_eq!(report.failed_skus(), vec!["A"]);
    assert_eq!(
        report.failed_jobs[0].error.as_deref(),
        Some("submission rejected: quota exceeded")
    );
    assert_eq!(client.submit_count("A"), 1);

    let entries = runtime.dead_letters().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request.sku, "A");
    assert_eq!(entries[0].request.run_id, admission.run_id);

    let result = runtime.redrive(entries[0].id).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.sku, "A");
    assert_eq!(client.submit_count("A"), 2);
    assert!(runtime.dead_letters().await.unwrap().is_empty());

    // The run was finalized before the redrive, so its report is unchanged.
    let report = runtime.await_run(admission.run_id).await.unwrap();
    assert_eq!(report.failed_skus(), vec!["A"]);
    sink.assert_report_count_eq(1);

    let mut late = false;
    while let Ok(event) = events.try_recv() {
        if let WorkflowEventPayload::ResultDiscarded { reason, .. } = event.payload {
            late |= reason == DiscardReason::LateArrival;
        }
    }
    assert!(late, "redriven result should arrive after finalization");

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_redrive_of_unknown_entry_fails() {
    let reader = StaticRowReader::with_rows("sheet-1", &[], 0);
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);

    let err = runtime.redrive(uuid::Uuid::now_v7()).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test(start_paused = true)]
async fn test_delivery_failure_still_finalizes_the_run() {
    let reader = StaticRowReader::with_rows("sheet-1", &["A"], 0);
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::failing("chat webhook returned 500");
    let runtime = runtime(fast_config(2), &reader, &client, &sink);

    let (admission, report) = run_to_report(&runtime, "rev-1").await;

    assert!(report.complete);
    sink.assert_report_count_eq(1);
    let finalize = runtime
        .step_log()
        .step(admission.run_id, steps::AGGREGATE_FINALIZE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finalize.outcome.unwrap()["delivered"], false);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_source_fails_the_run() {
    let reader = StaticRowReader::missing();
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);

    let admission = runtime
        .handle_trigger(&TriggerEvent::new("sheet-doc", "rev-1"))
        .await
        .unwrap();
    let err = timeout(WAIT, runtime.await_run(admission.run_id))
        .await
        .unwrap()
        .unwrap_err();

    assert!(format!("{:#}", err).contains("not found"));
    sink.assert_report_count_eq(0);
    assert_eq!(
        runtime
            .step_log()
            .run(admission.run_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        RunStatus::Running
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_grid_rows_are_normalized_before_fan_out() {
    let reader = StaticRowReader::from_grid(
        "sheet-9",
        &grid(&[
            &[" sku ", "title", "is_active"],
            &["A", "Poster A", "true"],
            &["", "No sku", "TRUE"],
            &["", "", ""],
            &["B", "Poster B", "no"],
        ]),
    );
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);

    let (_, report) = run_to_report(&runtime, "rev-grid").await;

    assert_eq!(sorted(report.successful_skus()), vec!["A", "B"]);
    assert_eq!(report.invalid_rows_count, 1);
    assert_eq!(report.spreadsheet_id, "sheet-9");

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_follow_the_run() {
    let reader = StaticRowReader::with_rows("sheet-1", &["A", "B"], 0);
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = runtime(fast_config(2), &reader, &client, &sink);
    let mut events = runtime.events();

    let (admission, _) = run_to_report(&runtime, "rev-1").await;
    runtime.shutdown().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.run_id(), admission.run_id);
        assert_eq!(event.meta.correlation_id, admission.run_id.as_uuid());
        kinds.push(event.payload.kind());
    }

    let count = |kind: &str| kinds.iter().filter(|k| **k == kind).count();
    assert_eq!(kinds.first(), Some(&"run_admitted"));
    assert_eq!(count("job_emitted"), 2);
    assert_eq!(count("job_submitted"), 2);
    assert_eq!(count("job_succeeded"), 2);
    assert_eq!(count("run_finalized"), 1);
}

#[test]
fn test_builder_requires_collaborators() {
    let err = WorkflowRuntimeBuilder::new(AppConfig::default())
        .with_row_reader(Arc::new(StaticRowReader::with_rows("s", &[], 0)))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("render_client dependency missing"));

    let mut config = AppConfig::default();
    config.concurrency.limit = 0;
    let err = WorkflowRuntimeBuilder::new(config)
        .with_row_reader(Arc::new(StaticRowReader::with_rows("s", &[], 0)))
        .with_render_client(Arc::new(ScriptedRenderClient::new()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("concurrency"));
}
