//! Test: concurrency groups and global parallelism limits

use crate::helpers::*;
use runway::core::{RunStatus, TriggerEvent};
use runway::execution::SchedulingStrategy;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_group_limit_is_never_exceeded() {
    let yaml = r#"
name: deploys
concurrency:
  groups:
    prod: 1
jobs:
  eu:
    concurrencyGroup: prod
    steps: [{ run: "deploy-eu" }]
  us:
    concurrencyGroup: prod
    steps: [{ run: "deploy-us" }]
  asia:
    concurrencyGroup: prod
    steps: [{ run: "deploy-asia" }]
  docs:
    steps: [{ run: "docs" }]
"#;
    let nap = Script::Sleep(Duration::from_millis(30));
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with("deploy-eu", nap.clone())
            .with("deploy-us", nap.clone())
            .with("deploy-asia", nap.clone())
            .with("docs", nap),
    );
    let (engine, _) = engine(executor.clone(), test_config());

    let status = engine.run(graph(yaml), TriggerEvent::push("main")).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(executor.max_concurrency(&["eu", "us", "asia"]), 1);
    // Ungrouped jobs are not held back by the group
    assert_eq!(executor.max_concurrency(&["eu", "us", "asia", "docs"]), 2);
}

#[tokio::test]
async fn test_max_parallel_bounds_running_jobs() {
    let yaml = r#"
name: wide
concurrency:
  maxParallel: 2
jobs:
  a: { steps: [{ run: "a" }] }
  b: { steps: [{ run: "b" }] }
  c: { steps: [{ run: "c" }] }
  d: { steps: [{ run: "d" }] }
  e: { steps: [{ run: "e" }] }
"#;
    let nap = Script::Sleep(Duration::from_millis(20));
    let mut executor = ScriptedExecutor::new();
    for cmd in ["a", "b", "c", "d", "e"] {
        executor = executor.with(cmd, nap.clone());
    }
    let executor = Arc::new(executor);
    let (engine, _) = engine(executor.clone(), test_config());

    let status = engine.run(graph(yaml), TriggerEvent::push("main")).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert!(executor.max_concurrency(&["a", "b", "c", "d", "e"]) <= 2);
}

#[tokio::test]
async fn test_sequential_strategy_runs_one_job_at_a_time() {
    let yaml = r#"
name: seq
jobs:
  a: { steps: [{ run: "a" }] }
  b: { steps: [{ run: "b" }] }
  c: { steps: [{ run: "c" }] }
"#;
    let nap = Script::Sleep(Duration::from_millis(10));
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with("a", nap.clone())
            .with("b", nap.clone())
            .with("c", nap),
    );
    let config = test_config().with_strategy(SchedulingStrategy::Sequential);
    let (engine, _) = engine(executor.clone(), config);

    let status = engine.run(graph(yaml), TriggerEvent::push("main")).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(executor.max_concurrency(&["a", "b", "c"]), 1);
    assert_eq!(executor.start_order(), vec!["a", "b", "c"]);
}
