//! Test: trigger filters select jobs per event

use crate::helpers::*;
use runway::core::{JobReason, JobState, RunStatus, SkipReason, TriggerEvent};
use std::sync::Arc;

const PIPELINE: &str = r#"
name: triggered
jobs:
  build:
    steps: [{ run: "build" }]
  docs:
    trigger:
      paths: ["docs/**"]
    steps: [{ run: "docs" }]
  deploy:
    dependsOn: [build]
    trigger:
      branches: [main, "release/*"]
      events: [push, manual]
      pathsIgnore: ["docs/**"]
    steps: [{ run: "deploy" }]
  notify:
    dependsOn: [deploy]
    steps: [{ run: "notify" }]
"#;

#[tokio::test]
async fn test_feature_branch_skips_deploy_but_runs_dependents() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor.clone(), test_config());

    let event = TriggerEvent::pull_request("feature/login").with_changed_paths(["src/main.rs"]);
    let handle = engine.start(graph(PIPELINE), event);
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "build", JobState::Succeeded);
    assert_job(&snapshot, "docs", JobState::Skipped);
    assert_job(&snapshot, "deploy", JobState::Skipped);
    assert_eq!(
        job_reason(&snapshot, "deploy"),
        JobReason::Skipped(SkipReason::TriggerMismatch)
    );
    // A dependency skipped by its trigger counts as satisfied
    assert_job(&snapshot, "notify", JobState::Succeeded);
    assert_eq!(executor.call_count("deploy"), 0);
}

#[tokio::test]
async fn test_docs_only_change_on_main() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor.clone(), test_config());

    let event = TriggerEvent::push("main").with_changed_paths(["docs/intro.md", "docs/setup.md"]);
    let handle = engine.start(graph(PIPELINE), event);
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "docs", JobState::Succeeded);
    assert_job(&snapshot, "deploy", JobState::Skipped);
}

#[tokio::test]
async fn test_release_branch_push_deploys() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor.clone(), test_config());

    let event = TriggerEvent::push("release/1.2").with_changed_paths(["src/lib.rs", "docs/changelog.md"]);
    let status = engine.run(graph(PIPELINE), event).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(executor.call_count("deploy"), 1);
    assert_eq!(executor.call_count("notify"), 1);
}

#[tokio::test]
async fn test_manual_event_bypasses_path_filters() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor.clone(), test_config());

    let event = TriggerEvent::manual("main").with_changed_paths(["docs/intro.md"]);
    let status = engine.run(graph(PIPELINE), event).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(executor.call_count("deploy"), 1);
    assert_eq!(executor.call_count("docs"), 1);
}
