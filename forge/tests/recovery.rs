//! Recovery tests: a second runtime sharing the step log resumes runs the
//! first one left behind without repeating recorded side effects.

use std::sync::Arc;
use std::time::Duration;

use forge::steplog::steps;
use forge::*;
use forge_testkit::{
    fast_config, PollStep, RecordingReportSink, ScriptedAttempt,
    ScriptedRenderClient, StaticRowReader,
};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(30);

fn runtime_on(
    log: &Arc<InMemoryStepLog>,
    reader: &StaticRowReader,
    client: &ScriptedRenderClient,
    sink: &RecordingReportSink,
) -> WorkflowRuntime {
    WorkflowRuntimeBuilder::new(fast_config(2))
        .with_step_log(log.clone())
        .with_row_reader(Arc::new(reader.clone()))
        .with_render_client(Arc::new(client.clone()))
        .with_report_delivery(Arc::new(sink.clone()))
        .build()
        .expect("runtime builds")
}

/// The render path of one process: its own router, budget and event bus over
/// a shared step log.
fn render_process(
    log: &Arc<InMemoryStepLog>,
    client: &ScriptedRenderClient,
) -> (JobRunner, ResultRouter, Arc<InProcEventBus>) {
    let config = fast_config(2);
    let events = Arc::new(InProcEventBus::new(config.events.capacity));
    let router = ResultRouter::new();
    let shutdown = ShutdownToken::new();
    let machine = RenderMachine::new(
        Arc::new(client.clone()),
        Arc::new(InMemoryBudget::new(config.concurrency)),
        log.clone(),
        events.clone(),
        config.render,
        shutdown.clone(),
    );
    let runner = JobRunner::new(
        machine,
        log.clone(),
        Arc::new(InMemoryDeadLetterSink::new()),
        router.clone(),
        events.clone(),
        config.retry,
        shutdown,
    );
    (runner, router, events)
}

async fn wait_for_step(log: &InMemoryStepLog, run_id: RunId, step: &str) {
    timeout(WAIT, async {
        loop {
            if let Some(record) = log.step(run_id, step).await.unwrap() {
                if record.is_done() {
                    return;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("step {} never completed", step));
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_run_resumes_without_resubmitting() {
    let log = Arc::new(InMemoryStepLog::new());
    let reader = StaticRowReader::with_rows("sheet-1", &["A", "B"], 1);
    let client = ScriptedRenderClient::new();
    client.push_attempt(
        "B",
        ScriptedAttempt::accepted(
            std::iter::repeat(PollStep::Pending)
                .take(40)
                .chain([PollStep::Succeeded]),
        ),
    );

    let first_sink = RecordingReportSink::new();
    let first = runtime_on(&log, &reader, &client, &first_sink);
    let admission = first
        .handle_trigger(&TriggerEvent::new("sheet-doc", "rev-7"))
        .await
        .unwrap();
    let run_id = admission.run_id;

    wait_for_step(&log, run_id, &steps::aggregate_result("A")).await;
    wait_for_step(&log, run_id, &steps::submit(steps::RENDER_SCOPE, "B", 1)).await;
    first.shutdown().await.unwrap();

    first_sink.assert_report_count_eq(0);
    assert_eq!(
        log.run(run_id).await.unwrap().unwrap().status,
        RunStatus::Running
    );

    let second_sink = RecordingReportSink::new();
    let second = runtime_on(&log, &reader, &client, &second_sink);
    assert_eq!(second.recover().await.unwrap(), vec![run_id]);

    let report = timeout(WAIT, second.await_run(run_id))
        .await
        .unwrap()
        .unwrap();

    assert!(report.complete);
    let mut skus = report.successful_skus();
    skus.sort_unstable();
    assert_eq!(skus, vec!["A", "B"]);
    assert_eq!(report.invalid_rows_count, 1);

    assert_eq!(reader.read_count(), 1);
    assert_eq!(client.submit_count("A"), 1);
    assert_eq!(client.submit_count("B"), 1);
    second_sink.assert_report_count_eq(1);

    second.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_finalized_runs_are_not_recovered() {
    let log = Arc::new(InMemoryStepLog::new());
    let reader = StaticRowReader::with_rows("sheet-1", &["A"], 0);
    let client = ScriptedRenderClient::new();

    let first_sink = RecordingReportSink::new();
    let first = runtime_on(&log, &reader, &client, &first_sink);
    let admission = first
        .handle_trigger(&TriggerEvent::new("sheet-doc", "rev-1"))
        .await
        .unwrap();
    timeout(WAIT, first.await_run(admission.run_id))
        .await
        .unwrap()
        .unwrap();
    first.shutdown().await.unwrap();

    let second_sink = RecordingReportSink::new();
    let second = runtime_on(&log, &reader, &client, &second_sink);

    assert!(second.recover().await.unwrap().is_empty());
    let report = second.await_run(admission.run_id).await.unwrap();
    assert!(report.complete);
    second_sink.assert_report_count_eq(0);
    assert_eq!(client.total_submits(), 1);

    let again = second
        .handle_trigger(&TriggerEvent::new("sheet-doc", "rev-1"))
        .await
        .unwrap();
    assert!(!again.admitted);
    assert_eq!(again.run_id, admission.run_id);

    second.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_is_retried_by_recovery() {
    let log = Arc::new(InMemoryStepLog::new());
    let reader = StaticRowReader::missing();
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();

    let runtime = runtime_on(&log, &reader, &client, &sink);
    let admission = runtime
        .handle_trigger(&TriggerEvent::new("sheet-doc", "rev-3"))
        .await
        .unwrap();
    assert!(runtime.await_run(admission.run_id).await.is_err());

    reader.set_rows(ReadOutcome {
        valid_rows: forge_testkit::rows(&["A", "B"]),
        invalid_rows_count: 0,
        spreadsheet_id: "sheet-1".into(),
    });
    assert_eq!(runtime.recover().await.unwrap(), vec![admission.run_id]);

    let report = timeout(WAIT, runtime.await_run(admission.run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.successful_jobs.len(), 2);
    assert_eq!(reader.read_count(), 2);
    sink.assert_report_count_eq(1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_result_emitted_before_a_crash_reaches_the_next_aggregator() {
    let log = Arc::new(InMemoryStepLog::new());
    let client = ScriptedRenderClient::new();
    let trigger = TriggerEvent::new("sheet-doc", "rev-9");
    let run_id = RunId::for_revision(&trigger.revision_id);
    log.admit(WorkflowRun::new(run_id, &trigger)).await.unwrap();

    let request = JobRequest {
        run_id,
        sku: "A".into(),
        row_data: forge_testkit::row("A").data,
        spreadsheet_id: "sheet-1".into(),
    };

    // Emitted and routed, but the process stops before aggregation records it.
    let (first, _router, _events) = render_process(&log, &client);
    let result = first
        .run(request.clone(), steps::RENDER_SCOPE)
        .await
        .unwrap();
    let emitted = log
        .step(run_id, &steps::result(steps::RENDER_SCOPE, "A"))
        .await
        .unwrap()
        .unwrap();
    assert!(emitted.is_done());
    assert!(log
        .step(run_id, &steps::aggregate_result("A"))
        .await
        .unwrap()
        .is_none());

    let (second, router, events) = render_process(&log, &client);
    let subscription = router.subscribe(run_id).await;
    let rerun = second.run(request, steps::RENDER_SCOPE).await.unwrap();
    assert_eq!(rerun, result);

    let sink = RecordingReportSink::new();
    let aggregator = FanInAggregator::new(
        log.clone(),
        router,
        Arc::new(sink.clone()),
        events,
        Duration::from_secs(60),
        ShutdownToken::new(),
    );
    let aggregation = AggregationRequest {
        run_id,
        total_jobs: 1,
        invalid_rows_count: 0,
        spreadsheet_id: "sheet-1".into(),
    };
    let report = timeout(WAIT, aggregator.aggregate(&aggregation, subscription))
        .await
        .unwrap()
        .unwrap();

    assert!(report.complete);
    assert_eq!(report.successful_skus(), vec!["A"]);
    assert_eq!(client.submit_count("A"), 1);
    sink.assert_report_count_eq(1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_fans_out_recorded_rows_after_the_sheet_changed() {
    let log = Arc::new(InMemoryStepLog::new());
    let trigger = TriggerEvent::new("sheet-doc", "rev-4");
    let run_id = RunId::for_revision(&trigger.revision_id);
    log.admit(WorkflowRun::new(run_id, &trigger)).await.unwrap();

    // The fan-out plan was recorded before the process stopped.
    let plan = FanOutPlan::from_rows(&ReadOutcome {
        valid_rows: forge_testkit::rows(&["A", "B"]),
        invalid_rows_count: 1,
        spreadsheet_id: "sheet-1".into(),
    });
    log.record_intent(run_id, steps::FAN_OUT, serde_json::to_value(&plan).unwrap())
        .await
        .unwrap();

    // Row B has since been removed from the sheet.
    let reader = StaticRowReader::with_rows("sheet-2", &["A"], 0);
    let client = ScriptedRenderClient::new();
    let sink = RecordingReportSink::new();
    let runtime = runtime_on(&log, &reader, &client, &sink);

    assert_eq!(runtime.recover().await.unwrap(), vec![run_id]);
    let report = timeout(WAIT, runtime.await_run(run_id))
        .await
        .unwrap()
        .unwrap();

    assert!(report.complete);
    let mut skus = report.successful_skus();
    skus.sort_unstable();
    assert_eq!(skus, vec!["A", "B"]);
    assert_eq!(report.invalid_rows_count, 1);
    assert_eq!(report.spreadsheet_id, "sheet-1");
    assert_eq!(reader.read_count(), 0);
    assert_eq!(client.submit_count("B"), 1);
    sink.assert_report_count_eq(1);

    runtime.shutdown().await.unwrap();
}
