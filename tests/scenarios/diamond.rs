//! Test: diamond graph A -> {B, C} -> D

use crate::helpers::*;
use runway::core::{JobReason, JobState, RunStatus, SkipReason, TriggerEvent};
use std::sync::Arc;

const DIAMOND: &str = r#"
name: diamond
jobs:
  a:
    steps: [{ run: "step-a" }]
  b:
    dependsOn: [a]
    steps: [{ run: "step-b" }]
  c:
    dependsOn: [a]
    steps: [{ run: "step-c" }]
  d:
    dependsOn: [b, c]
    steps: [{ run: "step-d" }]
"#;

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(DIAMOND), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    let order = executor.start_order();
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("d"));
    assert_eq!(order.len(), 4);

    let snapshot = engine.status(run_id).unwrap();
    for job in ["a", "b", "c", "d"] {
        assert_job(&snapshot, job, JobState::Succeeded);
    }
}

#[tokio::test]
async fn test_diamond_with_failing_branch_skips_join() {
    let executor = Arc::new(ScriptedExecutor::new().with("step-c", Script::Fail(3)));
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(DIAMOND), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert_run(&snapshot, RunStatus::Failed);
    assert_job(&snapshot, "a", JobState::Succeeded);
    assert_job(&snapshot, "b", JobState::Succeeded);
    assert_job(&snapshot, "c", JobState::Failed);
    assert_job(&snapshot, "d", JobState::Skipped);
    assert_eq!(
        job_reason(&snapshot, "d"),
        JobReason::Skipped(SkipReason::DependencyFailed {
            dependency: "c".to_string()
        })
    );
    assert_eq!(executor.call_count("step-d"), 0);
}

#[tokio::test]
async fn test_sibling_branch_continues_after_failure() {
    let yaml = r#"
name: branches
jobs:
  lint:
    steps: [{ run: "lint" }]
  docs:
    dependsOn: [lint]
    steps: [{ run: "docs" }]
  build:
    steps: [{ run: "build" }]
  package:
    dependsOn: [build]
    steps: [{ run: "package" }]
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("lint", Script::Fail(1)));
    let (engine, _) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "docs", JobState::Skipped);
    assert_job(&snapshot, "package", JobState::Succeeded);
}
