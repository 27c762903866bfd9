//! Stress tests: hundreds of rows under a tight concurrency ceiling, mixed
//! outcomes, and concurrent triggers for the same revision.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use forge::*;
use forge_testkit::{
    fast_config, PollStep, RecordingReportSink, ScriptedAttempt,
    ScriptedRenderClient, StaticRowReader,
};
use futures::future::join_all;
use tokio::time::timeout;

const ROWS: usize = 300;
const LIMIT: usize = 8;

fn sku(i: usize) -> String {
    format!("SKU-{i:04}")
}

#[tokio::test(start_paused = true)]
async fn stress_mixed_outcomes_under_ceiling() {
    let skus: Vec<String> = (0..ROWS).map(sku).collect();
    let sku_refs: Vec<&str> = skus.iter().map(String::as_str).collect();
    let reader = StaticRowReader::with_rows("sheet-big", &sku_refs, 17);

    let client = ScriptedRenderClient::new();
    let mut expect_failed = HashSet::new();
    for (i, sku) in skus.iter().enumerate() {
        match i % 10 {
            0 => {
                client
                    .push_attempt(sku.as_str(), ScriptedAttempt::failing("bad template"))
                    .push_attempt(sku.as_str(), ScriptedAttempt::failing("bad template"));
                expect_failed.insert(sku.clone());
            }
            1 => {
                client
                    .push_attempt(sku.as_str(), ScriptedAttempt::failing("flaky"))
                    .push_attempt(sku.as_str(), ScriptedAttempt::succeeding());
            }
            2 => {
                client.push_attempt(
                    sku.as_str(),
                    ScriptedAttempt::accepted([
                        PollStep::Transient("502".into()),
                        PollStep::Pending,
                        PollStep::Succeeded,
                    ]),
                );
            }
            _ => {
                client.push_attempt(sku.as_str(), ScriptedAttempt::succeeding());
            }
        }
    }

    let sink = RecordingReportSink::new();
    let runtime = WorkflowRuntimeBuilder::new(fast_config(LIMIT))
        .with_row_reader(Arc::new(reader.clone()))
        .with_render_client(Arc::new(client.clone()))
        .with_report_delivery(Arc::new(sink.clone()))
        .build()
        .unwrap();

    let admission = runtime
        .handle_trigger(&TriggerEvent::new("sheet-doc", "rev-big"))
        .await
        .unwrap();
    let report = timeout(Duration::from_secs(600), runtime.await_run(admission.run_id))
        .await
        .expect("run finished in time")
        .unwrap();

    assert!(report.complete);
    assert_eq!(report.received(), ROWS);
    assert_eq!(report.invalid_rows_count, 17);

    let failed: HashSet<String> =
        report.failed_skus().into_iter().map(String::from).collect();
    assert_eq!(failed, expect_failed);

    let mut all: Vec<&str> = report
        .successful_skus()
        .into_iter()
        .chain(report.failed_skus())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), ROWS, "every sku reported exactly once");

    client.assert_max_in_flight_le(LIMIT);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(runtime.dead_letters().await.unwrap().len(), expect_failed.len());
    sink.assert_report_count_eq(1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stress_concurrent_triggers_admit_one_run_per_revision() {
    let reader = StaticRowReader::with_rows("sheet-1", &["A", "B", "C"], 0);
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = Arc::new(
        WorkflowRuntimeBuilder::new(fast_config(4))
            .with_row_reader(Arc::new(reader.clone()))
            .with_render_client(Arc::new(client.clone()))
            .with_report_delivery(Arc::new(sink.clone()))
            .build()
            .unwrap(),
    );

    let revisions = ["rev-a", "rev-b", "rev-c"];
    let triggers = (0..30).map(|i| {
        let runtime = runtime.clone();
        let revision = revisions[i % revisions.len()];
        async move {
            runtime
                .handle_trigger(&TriggerEvent::new("sheet-doc", revision))
                .await
                .unwrap()
        }
    });
    let admissions = join_all(triggers).await;

    let admitted: Vec<&Admission> = admissions.iter().filter(|a| a.admitted).collect();
    assert_eq!(admitted.len(), revisions.len());

    let run_ids: HashSet<RunId> = admissions.iter().map(|a| a.run_id).collect();
    assert_eq!(run_ids.len(), revisions.len());

    for run_id in &run_ids {
        let report = timeout(Duration::from_secs(60), runtime.await_run(*run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.successful_jobs.len(), 3);
    }

    assert_eq!(reader.read_count(), revisions.len());
    assert_eq!(client.total_submits(), 3 * revisions.len());
    sink.assert_report_count_eq(revisions.len());

    runtime.shutdown().await.unwrap();
}
