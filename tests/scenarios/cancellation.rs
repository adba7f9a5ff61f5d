//! Test: cancelling a run with running and blocked jobs

use crate::helpers::*;
use runway::core::{CancelReason, JobReason, JobState, RunStatus, TriggerEvent};
use std::sync::Arc;
use std::time::Duration;

const PIPELINE: &str = r#"
name: cancel
jobs:
  p:
    steps: [{ run: "run-p" }]
  q:
    steps: [{ run: "run-q" }]
  r:
    dependsOn: [p]
    steps: [{ run: "run-r" }]
"#;

#[tokio::test]
async fn test_cancel_acknowledged_by_workers() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with("run-p", Script::Hang)
            .with("run-q", Script::Hang),
    );
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(PIPELINE), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    let mut stream = handle.stream();
    wait_until_running(&mut stream, &["p", "q"]).await;

    handle.cancel();
    let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run should finish after cancel")
        .unwrap();
    assert_eq!(status, RunStatus::Cancelled);

    let snapshot = engine.status(run_id).unwrap();
    assert_run(&snapshot, RunStatus::Cancelled);
    for job in ["p", "q", "r"] {
        assert_job(&snapshot, job, JobState::Cancelled);
        assert_eq!(
            job_reason(&snapshot, job),
            JobReason::Cancelled(CancelReason::Requested)
        );
    }
    assert_eq!(executor.call_count("run-r"), 0);
}

#[tokio::test]
async fn test_blocked_job_cancelled_before_running_ones() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with("run-p", Script::Hang)
            .with("run-q", Script::Hang),
    );
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(PIPELINE), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    let mut stream = handle.stream();
    wait_until_running(&mut stream, &["p", "q"]).await;
    handle.cancel();
    handle.wait().await.unwrap();

    // r reaches Cancelled in the ledger before either running job
    let cancelled: Vec<String> = engine
        .ledger()
        .events(run_id, 0)
        .into_iter()
        .filter_map(|e| match e.kind {
            runway::ledger::EventKind::JobStateChanged { job, to: JobState::Cancelled, .. } => Some(job),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled.first().map(String::as_str), Some("r"));
    assert_eq!(cancelled.len(), 3);
}

#[tokio::test]
async fn test_unresponsive_worker_force_cancelled_after_grace() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with("run-p", Script::Stubborn)
            .with("run-q", Script::Hang),
    );
    let config = test_config().with_cancel_grace(Duration::from_millis(100));
    let (engine, _) = engine(executor.clone(), config);

    let handle = engine.start(graph(PIPELINE), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    let mut stream = handle.stream();
    wait_until_running(&mut stream, &["p", "q"]).await;

    handle.cancel();
    let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("grace period should end the run")
        .unwrap();
    assert_eq!(status, RunStatus::Cancelled);

    let snapshot = engine.status(run_id).unwrap();
    assert_eq!(
        job_reason(&snapshot, "p"),
        JobReason::Cancelled(CancelReason::CancellationTimeout)
    );
    assert_eq!(
        job_reason(&snapshot, "q"),
        JobReason::Cancelled(CancelReason::Requested)
    );
    assert_job(&snapshot, "r", JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_after_finish_is_noop() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor, test_config());

    let handle = engine.start(graph(PIPELINE), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    let canceller = handle.canceller();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    canceller.cancel();
    assert_eq!(engine.status(run_id).unwrap().status, RunStatus::Succeeded);
}
