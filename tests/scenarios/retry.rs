//! Test: retry policies and failure classification

use crate::helpers::*;
use runway::core::{FailureReason, JobReason, JobState, RunStatus, TriggerEvent};
use runway::ledger::EventKind;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_flaky_job_succeeds_on_retry() {
    let yaml = r#"
name: flaky
jobs:
  test:
    retry:
      attempts: 3
      backoff: { initialSecs: 0.01, factor: 2 }
    steps: [{ run: "cargo test" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("cargo test", Script::FailFirst(2, 101)));
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);
    assert_eq!(executor.call_count("cargo test"), 3);

    let attempts: Vec<u32> = executor.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let retries: Vec<(u32, u64)> = engine
        .ledger()
        .events(run_id, 0)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::JobRetrying { attempt, delay_ms, .. } => Some((attempt, delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(2, 10), (3, 20)]);

    let snapshot = engine.status(run_id).unwrap();
    assert_eq!(snapshot.job("test").unwrap().attempts, 3);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let yaml = r#"
name: broken
jobs:
  test:
    retry: { attempts: 2, backoff: { initialSecs: 0.01 } }
    steps: [{ run: "cargo test" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("cargo test", Script::Fail(101)));
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);
    assert_eq!(executor.call_count("cargo test"), 2);

    let snapshot = engine.status(run_id).unwrap();
    assert_eq!(
        job_reason(&snapshot, "test"),
        JobReason::Failed(FailureReason::StepFailure {
            step: "cargo test".to_string(),
            exit_code: 101
        })
    );
}

#[tokio::test]
async fn test_panicked_worker_is_reported_as_lost() {
    let yaml = r#"
name: crash
jobs:
  build:
    steps: [{ run: "explode" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("explode", Script::Panic));
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert!(matches!(
        job_reason(&snapshot, "build"),
        JobReason::Failed(FailureReason::WorkerLost { .. })
    ));
}

#[tokio::test]
async fn test_lost_worker_is_retried() {
    let yaml = r#"
name: crash-retry
jobs:
  build:
    retry: { attempts: 2, backoff: { initialSecs: 0 } }
    steps: [{ run: "explode" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("explode", Script::Panic));
    let (engine, _) = engine(executor.clone(), test_config());

    let status = engine.run(graph(yaml), TriggerEvent::push("main")).await.unwrap();
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(executor.call_count("explode"), 2);
}

#[tokio::test]
async fn test_missing_output_is_not_retried() {
    let yaml = r#"
name: outputs
jobs:
  build:
    retry: { attempts: 3, backoff: { initialSecs: 0.01 } }
    artifacts: { outputs: [binary] }
    steps: [{ run: "make" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);
    assert_eq!(executor.call_count("make"), 1);

    let snapshot = engine.status(run_id).unwrap();
    assert_eq!(
        job_reason(&snapshot, "build"),
        JobReason::Failed(FailureReason::MissingOutput {
            artifact: "binary".to_string()
        })
    );
}

#[tokio::test]
async fn test_job_timeout_fails_attempt() {
    let yaml = r#"
name: slow
jobs:
  build:
    steps: [{ run: "forever" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("forever", Script::Hang));
    let config = test_config().with_job_timeout(Duration::from_millis(50));
    let (engine, _) = engine(executor.clone(), config);

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "build", JobState::Failed);
    assert!(matches!(
        job_reason(&snapshot, "build"),
        JobReason::Failed(FailureReason::Timeout { .. })
    ));
}
