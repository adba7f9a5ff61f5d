//! Test: allowFailure lets dependents proceed

use crate::helpers::*;
use runway::core::{FailureReason, JobReason, JobState, RunStatus, SkipReason, TriggerEvent};
use std::sync::Arc;

#[tokio::test]
async fn test_allowed_failure_keeps_run_green() {
    let yaml = r#"
name: allow
jobs:
  a:
    steps: [{ run: "step-a" }]
  b:
    dependsOn: [a]
    steps: [{ run: "step-b" }]
  c:
    dependsOn: [a]
    allowFailure: true
    steps: [{ run: "step-c" }]
  d:
    dependsOn: [b, c]
    steps: [{ run: "step-d" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("step-c", Script::Fail(2)));
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "c", JobState::Failed);
    assert_eq!(
        job_reason(&snapshot, "c"),
        JobReason::Failed(FailureReason::StepFailure {
            step: "step-c".to_string(),
            exit_code: 2
        })
    );
    assert_job(&snapshot, "d", JobState::Succeeded);
    assert_eq!(executor.call_count("step-d"), 1);
}

#[tokio::test]
async fn test_skips_propagate_transitively() {
    let yaml = r#"
name: chain
jobs:
  a:
    steps: [{ run: "step-a" }]
  b:
    dependsOn: [a]
    steps: [{ run: "step-b" }]
  c:
    dependsOn: [b]
    steps: [{ run: "step-c" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("step-a", Script::Fail(1)));
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "b", JobState::Skipped);
    assert_job(&snapshot, "c", JobState::Skipped);
    assert_eq!(
        job_reason(&snapshot, "c"),
        JobReason::Skipped(SkipReason::DependencyFailed {
            dependency: "b".to_string()
        })
    );
}

#[tokio::test]
async fn test_continue_on_error_step() {
    let yaml = r#"
name: tolerant
jobs:
  build:
    steps:
      - run: "flaky-lint"
        continueOnError: true
      - run: "compile"
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("flaky-lint", Script::Fail(1)));
    let (engine, _) = engine(executor.clone(), test_config());

    let status = engine.run(graph(yaml), TriggerEvent::push("main")).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(executor.call_count("compile"), 1);
}
