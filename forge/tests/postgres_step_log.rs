//! Integration tests for the PostgreSQL step log: first-writer-wins
//! semantics of admission, step intents and step outcomes.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with: `cargo test --test postgres_step_log --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use forge::persistence::PostgresStepLog;
use forge::*;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn step_log() -> PostgresStepLog {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to postgres");
    let log = PostgresStepLog::new(pool);
    log.ensure_schema().await.expect("apply schema");
    log
}

/// A trigger with a revision id no other test run has used.
fn fresh_trigger() -> TriggerEvent {
    TriggerEvent::new("sheet-doc", format!("rev-{}", Uuid::new_v4()))
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_admit_is_once_per_revision() {
    let log = step_log().await;
    let trigger = fresh_trigger();
    let run_id = RunId::for_revision(&trigger.revision_id);

    let first = log.admit(WorkflowRun::new(run_id, &trigger)).await.unwrap();
    let second = log.admit(WorkflowRun::new(run_id, &trigger)).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.run.run_id, run_id);
    assert_eq!(second.run.status, RunStatus::Running);

    let by_revision = log
        .run_for_revision(&trigger.revision_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_revision.run_id, run_id);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_totals_and_status_updates() {
    let log = step_log().await;
    let trigger = fresh_trigger();
    let run_id = RunId::for_revision(&trigger.revision_id);
    log.admit(WorkflowRun::new(run_id, &trigger)).await.unwrap();

    log.set_run_totals(run_id, "sheet-1", 3, 1).await.unwrap();
    log.set_run_totals(run_id, "sheet-2", 9, 9).await.unwrap();
    log.set_run_status(run_id, RunStatus::TimedOut).await.unwrap();

    let run = log.run(run_id).await.unwrap().unwrap();
    assert_eq!(run.spreadsheet_id.as_deref(), Some("sheet-1"));
    assert_eq!(run.total_jobs, Some(3));
    assert_eq!(run.invalid_rows_count, Some(1));
    assert_eq!(run.status, RunStatus::TimedOut);

    let timed_out = log.runs_with_status(RunStatus::TimedOut).await.unwrap();
    assert!(timed_out.iter().any(|r| r.run_id == run_id));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_first_intent_and_first_outcome_win() {
    let log = step_log().await;
    let trigger = fresh_trigger();
    let run_id = RunId::for_revision(&trigger.revision_id);
    log.admit(WorkflowRun::new(run_id, &trigger)).await.unwrap();

    let first = log
        .record_intent(run_id, "request/A", json!({"sku": "A"}))
        .await
        .unwrap();
    let second = log
        .record_intent(run_id, "request/A", json!({"sku": "other"}))
        .await
        .unwrap();
    assert!(first.inserted());
    assert!(!second.inserted());
    assert_eq!(second.record().intent, json!({"sku": "A"}));
    assert_eq!(second.record().state, StepState::Intent);

    let done = log
        .complete_step(run_id, "request/A", Some(json!({"emitted": true})))
        .await
        .unwrap();
    let again = log
        .complete_step(run_id, "request/A", Some(json!({"emitted": false})))
        .await
        .unwrap();
    assert!(done.is_done());
    assert_eq!(again.outcome, Some(json!({"emitted": true})));

    assert!(log
        .complete_step(run_id, "request/missing", None)
        .await
        .is_err());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_steps_keep_recording_order() {
    let log = step_log().await;
    let trigger = fresh_trigger();
    let run_id = RunId::for_revision(&trigger.revision_id);
    log.admit(WorkflowRun::new(run_id, &trigger)).await.unwrap();

    for step in ["fan-out", "request/B", "request/A", "aggregate/request"] {
        log.record_intent(run_id, step, json!({})).await.unwrap();
    }
    log.record_intent(run_id, "request/B", json!({"replay": true}))
        .await
        .unwrap();

    let names: Vec<String> = log
        .steps_for_run(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.step)
        .collect();
    assert_eq!(
        names,
        vec!["fan-out", "request/B", "request/A", "aggregate/request"]
    );
}
