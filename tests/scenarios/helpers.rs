//! Test utilities for scenario tests

use async_trait::async_trait;
use runway::artifact::{ArtifactStore, InMemoryArtifactStore};
use runway::core::{JobReason, JobState, PipelineConfig, PipelineGraph, RunStatus, Step, StepAction};
use runway::execution::{EngineConfig, ExecutionEngine};
use runway::executor::{CancelSignal, ExecutorError, StepEnv, StepExecutor, StepOutcome};
use runway::ledger::{EventKind, RunSnapshot};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behavior of a scripted command
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(i32),
    /// Fail the first `n` calls, then succeed
    FailFirst(usize, i32),
    /// Succeed after a delay; stops early when cancelled
    Sleep(Duration),
    /// Wait until cancelled
    Hang,
    /// Never return, even when cancelled
    Stubborn,
    /// Succeed and hand back an artifact
    Produce(String, Vec<u8>),
    /// Like `Produce`, with the content numbered by call: `<name>-<n>`
    ProduceNumbered(String),
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Started(String),
    Finished(String),
}

/// A command the executor saw
#[derive(Debug, Clone)]
pub struct Call {
    pub job: String,
    pub command: String,
    pub attempt: u32,
    pub env: BTreeMap<String, String>,
}

/// Executor that plays back scripts keyed by command; unknown commands succeed
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    counts: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<Call>>,
    activity: Mutex<Vec<Activity>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, command: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(command.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.counts.lock().unwrap().get(command).copied().unwrap_or(0)
    }

    /// Jobs in the order their first command started
    pub fn start_order(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.activity
            .lock()
            .unwrap()
            .iter()
            .filter_map(|a| match a {
                Activity::Started(job) if seen.insert(job.clone()) => Some(job.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of the given jobs executing at once
    pub fn max_concurrency(&self, jobs: &[&str]) -> usize {
        let mut current = 0usize;
        let mut max = 0usize;
        for activity in self.activity.lock().unwrap().iter() {
            match activity {
                Activity::Started(job) if jobs.contains(&job.as_str()) => {
                    current += 1;
                    max = max.max(current);
                }
                Activity::Finished(job) if jobs.contains(&job.as_str()) => {
                    current -= 1;
                }
                _ => {}
            }
        }
        max
    }

    fn record(&self, activity: Activity) {
        self.activity.lock().unwrap().push(activity);
    }
}

/// Records the end of a command even if its future is dropped
struct FinishGuard<'a> {
    executor: &'a ScriptedExecutor,
    job: String,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.executor.record(Activity::Finished(self.job.clone()));
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &Step,
        env: &StepEnv,
        mut cancel: CancelSignal,
    ) -> Result<StepOutcome, ExecutorError> {
        let StepAction::Run { command } = &step.action else {
            return Err(ExecutorError::Unsupported(step.name.clone()));
        };

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or(Script::Succeed);
        let call = {
            let mut counts = self.counts.lock().unwrap();
            let count = counts.entry(command.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.calls.lock().unwrap().push(Call {
            job: env.job.clone(),
            command: command.clone(),
            attempt: env.attempt,
            env: env.vars.clone(),
        });

        self.record(Activity::Started(env.job.clone()));
        let _guard = FinishGuard {
            executor: self,
            job: env.job.clone(),
        };

        match script {
            Script::Succeed => Ok(StepOutcome::success().with_log(format!("ran {}", command))),
            Script::Fail(code) => Ok(StepOutcome::failure(code).with_log(format!("{} failed", command))),
            Script::FailFirst(n, code) if call <= n => Ok(StepOutcome::failure(code)),
            Script::FailFirst(..) => Ok(StepOutcome::success()),
            Script::Sleep(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(StepOutcome::success()),
                    _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
                }
            }
            Script::Hang => {
                cancel.cancelled().await;
                Err(ExecutorError::Cancelled)
            }
            Script::Stubborn => std::future::pending().await,
            Script::Produce(name, content) => Ok(StepOutcome::success().with_artifact(name, content)),
            Script::ProduceNumbered(name) => {
                let content = format!("{}-{}", name, call);
                Ok(StepOutcome::success().with_artifact(name, content.into_bytes()))
            }
            Script::Panic => panic!("scripted panic in {}", command),
        }
    }
}

pub fn graph(yaml: &str) -> Arc<PipelineGraph> {
    let config = PipelineConfig::from_yaml(yaml).expect("pipeline should parse");
    Arc::new(config.to_graph().expect("pipeline should be valid"))
}

/// Engine over a scripted executor and an in-memory artifact store
pub fn engine(executor: Arc<ScriptedExecutor>, config: EngineConfig) -> (ExecutionEngine, Arc<InMemoryArtifactStore>) {
    let store = Arc::new(InMemoryArtifactStore::new());
    let artifacts: Arc<dyn ArtifactStore> = store.clone();
    let engine = ExecutionEngine::new(executor, artifacts).with_config(config);
    (engine, store)
}

/// Fast defaults for tests
pub fn test_config() -> EngineConfig {
    EngineConfig::new()
        .with_gate_timeout(Duration::from_secs(5))
        .with_cancel_grace(Duration::from_secs(5))
}

pub fn assert_job(snapshot: &RunSnapshot, job: &str, state: JobState) {
    let actual = snapshot
        .job(job)
        .unwrap_or_else(|| panic!("job '{}' not in snapshot", job))
        .state;
    assert_eq!(actual, state, "job '{}' should be {:?}, was {:?}", job, state, actual);
}

pub fn job_reason(snapshot: &RunSnapshot, job: &str) -> JobReason {
    snapshot
        .job(job)
        .and_then(|j| j.reason.clone())
        .unwrap_or_else(|| panic!("job '{}' has no reason", job))
}

pub fn assert_run(snapshot: &RunSnapshot, status: RunStatus) {
    assert_eq!(snapshot.status, status, "run status");
}

/// Wait on an event stream until every given job is Running
pub async fn wait_until_running(stream: &mut runway::ledger::EventStream, jobs: &[&str]) {
    let mut running = HashSet::new();
    while running.len() < jobs.len() {
        let event = stream.next().await.expect("run ended before jobs were running");
        if let EventKind::StepStarted { job, .. } = &event.kind {
            if jobs.contains(&job.as_str()) {
                running.insert(job.clone());
            }
        }
    }
}
