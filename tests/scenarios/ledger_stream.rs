//! Test: ledger streaming, snapshots and run context

use crate::helpers::*;
use runway::core::{RunStatus, TriggerEvent};
use runway::ledger::{EventKind, RunEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_stream::StreamExt;

const PIPELINE: &str = r#"
name: observed
variables:
  target: staging
env:
  CI: "true"
jobs:
  build:
    env:
      PROFILE: release
    steps:
      - run: "build"
        env:
          PROFILE: debug
  deploy:
    dependsOn: [build]
    steps: [{ run: "deploy {{ target }}" }]
"#;

#[tokio::test]
async fn test_live_stream_delivers_whole_log_in_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor, test_config());

    let handle = engine.start(graph(PIPELINE), TriggerEvent::push("main"));
    let events: Vec<RunEvent> = handle.stream().into_stream().collect().await;
    let run_id = handle.run_id();
    handle.wait().await.unwrap();

    assert!(matches!(events.first().unwrap().kind, EventKind::RunStarted { .. }));
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::RunFinished {
            status: RunStatus::Succeeded
        }
    ));
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
        assert_eq!(event.run_id, run_id);
    }
    assert_eq!(events, engine.ledger().events(run_id, 0));
}

#[tokio::test]
async fn test_stream_resumes_from_offset() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor, test_config());

    let handle = engine.start(graph(PIPELINE), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    handle.wait().await.unwrap();

    let all = engine.ledger().events(run_id, 0);
    let mut stream = engine.ledger().stream(run_id, 3);
    let mut resumed = Vec::new();
    while let Some(event) = stream.next().await {
        resumed.push(event);
    }
    assert_eq!(resumed.as_slice(), &all[3..]);
}

#[tokio::test]
async fn test_snapshot_of_finished_run_is_stable() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor, test_config());

    let handle = engine.start(graph(PIPELINE), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    handle.wait().await.unwrap();

    let first = engine.status(run_id).unwrap();
    let second = engine.status(run_id).unwrap();
    assert_eq!(first, second);
    assert!(first.is_terminal());
    assert_eq!(first.pipeline, "observed");
    assert_eq!(first.event_count, engine.ledger().events(run_id, 0).len());
    assert_eq!(first.job("build").unwrap().log_lines, 1);
}

#[tokio::test]
async fn test_variables_and_environment_reach_steps() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (engine, _) = engine(executor.clone(), test_config());

    let mut overrides = HashMap::new();
    overrides.insert("target".to_string(), "production".to_string());
    let handle = engine.start_with_variables(graph(PIPELINE), TriggerEvent::push("main"), overrides);
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    assert_eq!(executor.call_count("deploy production"), 1);

    let calls = executor.calls();
    let build = calls.iter().find(|c| c.job == "build").unwrap();
    assert_eq!(build.env.get("CI").map(String::as_str), Some("true"));
    assert_eq!(build.env.get("PROFILE").map(String::as_str), Some("debug"));
    assert_eq!(build.env.get("RUNWAY_JOB").map(String::as_str), Some("build"));
    assert_eq!(build.env.get("RUNWAY_ATTEMPT").map(String::as_str), Some("1"));
    assert_eq!(build.env.get("RUNWAY_BRANCH").map(String::as_str), Some("main"));
    assert_eq!(
        build.env.get("RUNWAY_RUN_ID").map(String::as_str),
        Some(run_id.to_string().as_str())
    );
}
