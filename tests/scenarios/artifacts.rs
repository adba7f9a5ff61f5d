//! Test: artifacts passed between jobs

use crate::helpers::*;
use chrono::Utc;
use runway::artifact::{ArtifactStore, RetentionPolicy};
use runway::core::{FailureReason, JobReason, JobState, RunStatus, TriggerEvent};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_upload_then_download_through_workspace() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("app.bin"), b"binary-v1").unwrap();

    let yaml = r#"
name: release
jobs:
  build:
    steps:
      - run: "make"
      - upload: { artifact: app, path: app.bin }
  deploy:
    dependsOn: [build]
    artifacts: { inputs: [app] }
    steps:
      - download: { artifact: app, path: out/deployed.bin }
      - run: "ship"
"#;
    let executor = Arc::new(ScriptedExecutor::new());
    let config = test_config().with_workspace(workspace.path());
    let (engine, store) = engine(executor.clone(), config);

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    let deployed = std::fs::read(workspace.path().join("out/deployed.bin")).unwrap();
    assert_eq!(deployed, b"binary-v1");

    let listed = store.list(run_id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "app");
    assert_eq!(listed[0].size, 9);

    let snapshot = engine.status(run_id).unwrap();
    assert_eq!(snapshot.artifacts.len(), 1);
}

#[tokio::test]
async fn test_executor_artifacts_satisfy_declared_outputs() {
    let workspace = tempfile::tempdir().unwrap();
    let yaml = r#"
name: site
jobs:
  build:
    artifacts: { outputs: [site] }
    steps: [{ run: "hugo" }]
  publish:
    dependsOn: [build]
    steps:
      - download: { artifact: site, path: site.tgz }
"#;
    let executor = Arc::new(
        ScriptedExecutor::new().with("hugo", Script::Produce("site".to_string(), b"tarball".to_vec())),
    );
    let config = test_config().with_workspace(workspace.path());
    let (engine, store) = engine(executor.clone(), config);

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

    assert_eq!(store.get(run_id, "site").await.unwrap(), b"tarball");
    assert_eq!(std::fs::read(workspace.path().join("site.tgz")).unwrap(), b"tarball");
}

#[tokio::test]
async fn test_missing_workspace_file_fails_upload() {
    let workspace = tempfile::tempdir().unwrap();
    let yaml = r#"
name: missing
jobs:
  build:
    steps:
      - upload: { artifact: app, path: nowhere.bin }
"#;
    let executor = Arc::new(ScriptedExecutor::new());
    let config = test_config().with_workspace(workspace.path());
    let (engine, _) = engine(executor, config);

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert!(matches!(
        job_reason(&snapshot, "build"),
        JobReason::Failed(FailureReason::ExecutorError { .. })
    ));
}

#[tokio::test]
async fn test_retried_upload_of_same_content_is_accepted() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("report.xml"), b"<ok/>").unwrap();
    let yaml = r#"
name: flaky-upload
jobs:
  test:
    retry: { attempts: 2, backoff: { initialSecs: 0 } }
    steps:
      - upload: { artifact: report, path: report.xml }
      - run: "flaky"
"#;
    let executor = Arc::new(ScriptedExecutor::new().with("flaky", Script::FailFirst(1, 1)));
    let config = test_config().with_workspace(workspace.path());
    let (engine, _) = engine(executor.clone(), config);

    let status = engine.run(graph(yaml), TriggerEvent::push("main")).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(executor.call_count("flaky"), 2);
}

#[tokio::test]
async fn test_retention_applied_when_run_ends() {
    let yaml = r#"
name: retained
jobs:
  build:
    artifacts: { outputs: [log] }
    steps: [{ run: "build" }]
"#;
    let executor = Arc::new(
        ScriptedExecutor::new().with("build", Script::Produce("log".to_string(), b"done".to_vec())),
    );
    let config = test_config().with_retention(RetentionPolicy::Window(Duration::from_secs(60)));
    let (engine, store) = engine(executor, config);

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    handle.wait().await.unwrap();

    assert_eq!(store.collect_expired(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + chrono::Duration::minutes(2);
    assert_eq!(store.collect_expired(later).await.unwrap(), 1);
    assert!(store.list(run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_artifact_fails_second_producer() {
    let yaml = r#"
name: clash
jobs:
  first:
    steps: [{ run: "build" }]
  second:
    dependsOn: [first]
    steps: [{ run: "rebuild" }]
  publish:
    dependsOn: [second]
    steps: [{ run: "publish" }]
"#;
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with("build", Script::Produce("site".to_string(), b"v1".to_vec()))
            .with("rebuild", Script::Produce("site".to_string(), b"v1".to_vec())),
    );
    let (engine, store) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "first", JobState::Succeeded);
    assert_job(&snapshot, "second", JobState::Failed);
    assert_job(&snapshot, "publish", JobState::Skipped);
    assert_eq!(
        job_reason(&snapshot, "second"),
        JobReason::Failed(FailureReason::ArtifactConflict {
            artifact: "site".to_string()
        })
    );
    assert_eq!(executor.call_count("publish"), 0);
    assert_eq!(store.get(run_id, "site").await.unwrap(), b"v1");
}

#[tokio::test]
async fn test_conflicting_upload_not_hidden_by_continue_on_error() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("public.tgz"), b"second build").unwrap();
    let yaml = r#"
name: clash
jobs:
  first:
    steps: [{ run: "build" }]
  second:
    dependsOn: [first]
    steps:
      - upload: { artifact: site, path: public.tgz }
        continueOnError: true
      - run: "after-upload"
"#;
    let executor = Arc::new(
        ScriptedExecutor::new().with("build", Script::Produce("site".to_string(), b"first build".to_vec())),
    );
    let config = test_config().with_workspace(workspace.path());
    let (engine, store) = engine(executor.clone(), config);

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert_job(&snapshot, "second", JobState::Failed);
    assert!(matches!(
        job_reason(&snapshot, "second"),
        JobReason::Failed(FailureReason::ArtifactConflict { .. })
    ));
    assert_eq!(executor.call_count("after-upload"), 0);
    assert_eq!(store.get(run_id, "site").await.unwrap(), b"first build");
}

#[tokio::test]
async fn test_retry_with_different_content_conflicts() {
    let yaml = r#"
name: drifting
jobs:
  test:
    retry: { attempts: 3, backoff: { initialSecs: 0 } }
    steps:
      - run: "generate"
      - run: "flaky"
"#;
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with("generate", Script::ProduceNumbered("report".to_string()))
            .with("flaky", Script::FailFirst(1, 1)),
    );
    let (engine, store) = engine(executor.clone(), test_config());

    let handle = engine.start(graph(yaml), TriggerEvent::push("main"));
    let run_id = handle.run_id();
    assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

    let snapshot = engine.status(run_id).unwrap();
    assert_eq!(
        job_reason(&snapshot, "test"),
        JobReason::Failed(FailureReason::ArtifactConflict {
            artifact: "report".to_string()
        })
    );
    // The conflict is not retried even though attempts remain
    assert_eq!(executor.call_count("generate"), 2);
    assert_eq!(executor.call_count("flaky"), 1);
    assert_eq!(store.get(run_id, "report").await.unwrap(), b"report-1");
}
