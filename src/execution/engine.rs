//! Main execution engine - orchestrates pipeline runs
//!
//! Each run gets a coordinator task that owns its [`Scheduler`]. Job attempts
//! execute on worker tasks which report back over a channel; only the
//! coordinator changes job state.

use crate::artifact::{ArtifactStore, RetentionPolicy};
use crate::core::context::RunContext;
use crate::core::error::DefinitionError;
use crate::core::job::JobId;
use crate::core::pipeline::PipelineGraph;
use crate::core::state::{AttemptOutcome, FailureReason, RunStatus};
use crate::core::trigger::TriggerEvent;
use crate::execution::runner::JobRunner;
use crate::execution::scheduler::{Dispatch, Scheduler, SchedulerStep, SchedulingStrategy};
use crate::executor::{CancelHandle, CancelSignal, StepExecutor};
use crate::gate::{ExternalCheck, GateEvaluator, GateResult};
use crate::ledger::{EventKind, EventStream, RunLedger, RunSnapshot};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors surfaced by the engine itself
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run coordinator failed: {0}")]
    Coordinator(String),
}

/// Configuration for the execution engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub strategy: SchedulingStrategy,

    /// Global bound on running jobs, on top of the strategy
    pub max_parallel: Option<usize>,

    /// How long cancelled workers get before they are force-marked
    pub cancel_grace: Duration,

    /// Gate timeout when neither the step nor the pipeline sets one
    pub gate_timeout: Duration,

    /// Attempt timeout for jobs without `timeoutSecs`
    pub job_timeout: Option<Duration>,

    /// Directory steps run in; upload and download paths are relative to it
    pub workspace: PathBuf,

    /// Retention applied to a run's artifacts once it ends
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::default(),
            max_parallel: None,
            cancel_grace: Duration::from_secs(10),
            gate_timeout: Duration::from_secs(600),
            job_timeout: None,
            workspace: PathBuf::from("."),
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Strategy with `max_parallel` folded in
    fn effective_strategy(&self) -> SchedulingStrategy {
        match (self.strategy, self.max_parallel) {
            (SchedulingStrategy::Sequential, _) => SchedulingStrategy::Sequential,
            (SchedulingStrategy::Parallel, Some(max)) => SchedulingStrategy::LimitedParallel(max),
            (SchedulingStrategy::LimitedParallel(n), Some(max)) => {
                SchedulingStrategy::LimitedParallel(n.min(max))
            }
            (strategy, None) => strategy,
        }
    }
}

/// Pipeline execution engine
///
/// Runs any number of pipelines concurrently against shared collaborators.
pub struct ExecutionEngine {
    executor: Arc<dyn StepExecutor>,
    artifacts: Arc<dyn ArtifactStore>,
    gates: GateEvaluator,
    ledger: RunLedger,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(executor: Arc<dyn StepExecutor>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            executor,
            artifacts,
            gates: GateEvaluator::new(),
            ledger: RunLedger::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn gates(&self) -> &GateEvaluator {
        &self.gates
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Feed an external check result to the gate of a job
    pub fn evaluate_gate(&self, run_id: Uuid, job: &str, check: ExternalCheck) -> GateResult {
        self.gates.evaluate(run_id, job, check)
    }

    /// Current snapshot of a run
    pub fn status(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        self.ledger.query(run_id).ok_or(EngineError::RunNotFound(run_id))
    }

    /// Release the ledger and gate state of a finished run
    ///
    /// Call once the run has been persisted elsewhere; returns `false` while
    /// the run is still live.
    pub fn forget_run(&self, run_id: Uuid) -> bool {
        if !self.ledger.forget_run(run_id) {
            return false;
        }
        self.gates.clear_run(run_id);
        debug!(%run_id, "forgot finished run");
        true
    }

    /// Start a run on a background coordinator task
    pub fn start(&self, graph: Arc<PipelineGraph>, event: TriggerEvent) -> RunHandle {
        self.start_with_variables(graph, event, HashMap::new())
    }

    /// Start a run with variable overrides
    pub fn start_with_variables(
        &self,
        graph: Arc<PipelineGraph>,
        event: TriggerEvent,
        variables: HashMap<String, String>,
    ) -> RunHandle {
        self.start_run(Uuid::new_v4(), graph, event, variables)
    }

    /// Start a run under a caller-chosen id
    ///
    /// Useful when gate results are fed before the run reaches its gates.
    pub fn start_run(
        &self,
        run_id: Uuid,
        graph: Arc<PipelineGraph>,
        event: TriggerEvent,
        variables: HashMap<String, String>,
    ) -> RunHandle {
        self.ledger.open_run(run_id);

        let ctx = RunContext::new(run_id, &graph, event).with_variables(variables);
        let runner = Arc::new(JobRunner {
            graph: graph.clone(),
            ctx: Arc::new(ctx),
            executor: self.executor.clone(),
            artifacts: self.artifacts.clone(),
            gates: self.gates.clone(),
            ledger: self.ledger.clone(),
            workspace: self.config.workspace.clone(),
            gate_timeout: self.config.gate_timeout,
            job_timeout: self.config.job_timeout,
        });

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            run_id,
            scheduler: Scheduler::new(graph, self.config.effective_strategy()),
            runner,
            ledger: self.ledger.clone(),
            artifacts: self.artifacts.clone(),
            gates: self.gates.clone(),
            cancel_grace: self.config.cancel_grace,
            retention: self.config.retention,
            workers: HashMap::new(),
            worker_tx,
            cancel_deadline: None,
        };
        let join = tokio::spawn(coordinator.run(worker_rx, control_rx));

        RunHandle {
            run_id,
            control: RunCanceller { tx: control_tx },
            join,
            ledger: self.ledger.clone(),
        }
    }

    /// Run a pipeline to completion
    pub async fn run(&self, graph: Arc<PipelineGraph>, event: TriggerEvent) -> Result<RunStatus, EngineError> {
        self.start(graph, event).wait().await
    }
}

enum Control {
    Cancel,
}

/// Cancels a run; cheap to clone
#[derive(Clone)]
pub struct RunCanceller {
    tx: mpsc::UnboundedSender<Control>,
}

impl RunCanceller {
    /// Request cancellation; a no-op once the run finished
    pub fn cancel(&self) {
        let _ = self.tx.send(Control::Cancel);
    }
}

/// Handle to a run in progress
pub struct RunHandle {
    run_id: Uuid,
    control: RunCanceller,
    join: JoinHandle<RunStatus>,
    ledger: RunLedger,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn canceller(&self) -> RunCanceller {
        self.control.clone()
    }

    /// Follow the run's events from the beginning
    pub fn stream(&self) -> EventStream {
        self.ledger.stream(self.run_id, 0)
    }

    pub fn snapshot(&self) -> Option<RunSnapshot> {
        self.ledger.query(self.run_id)
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> Result<RunStatus, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Coordinator(e.to_string()))
    }
}

/// Completion report of a worker
struct WorkerMessage {
    job: JobId,
    attempt: u32,
    outcome: AttemptOutcome,
}

struct Worker {
    attempt: u32,
    cancel: CancelHandle,
    abort: AbortHandle,
}

struct Coordinator {
    run_id: Uuid,
    scheduler: Scheduler,
    runner: Arc<JobRunner>,
    ledger: RunLedger,
    artifacts: Arc<dyn ArtifactStore>,
    gates: GateEvaluator,
    cancel_grace: Duration,
    retention: RetentionPolicy,
    workers: HashMap<JobId, Worker>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    cancel_deadline: Option<Instant>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> RunStatus {
        let graph = self.scheduler.graph().clone();
        let event = self.runner.ctx.event.clone();
        info!(run_id = %self.run_id, pipeline = %graph.name(), jobs = graph.len(), "starting run");

        self.ledger.append(
            self.run_id,
            EventKind::RunStarted {
                pipeline: graph.name().to_string(),
                event: event.clone(),
                jobs: graph.jobs().iter().map(|j| j.name.clone()).collect(),
            },
        );

        let step = self.scheduler.start(&event);
        self.apply(step);

        let mut control_open = true;
        while !self.scheduler.is_terminal() {
            if self.workers.is_empty() && self.cancel_deadline.is_none() {
                // Nothing can make progress; close the run out
                error!(run_id = %self.run_id, "no runnable work left in an unfinished run; cancelling");
                let (step, _) = self.scheduler.cancel();
                if step.is_empty() {
                    break;
                }
                self.apply(step);
                continue;
            }

            let deadline = self.cancel_deadline;
            tokio::select! {
                Some(message) = worker_rx.recv() => self.on_worker(message),
                control = control_rx.recv(), if control_open => match control {
                    Some(Control::Cancel) => self.on_cancel(),
                    None => control_open = false,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_grace_expired();
                }
            }
        }

        let status = self.scheduler.run_status();
        self.ledger.append(self.run_id, EventKind::RunFinished { status });
        info!(run_id = %self.run_id, pipeline = %graph.name(), %status, "run finished");

        if let Err(e) = self.artifacts.retain(self.run_id, self.retention).await {
            warn!(run_id = %self.run_id, error = %e, "failed to apply artifact retention");
        }
        self.gates.clear_run(self.run_id);

        status
    }

    fn on_worker(&mut self, message: WorkerMessage) {
        let current = self.workers.get(&message.job).map(|w| w.attempt);
        if current != Some(message.attempt) {
            debug!(job = %message.job, attempt = message.attempt, "ignoring stale worker report");
            return;
        }
        self.workers.remove(&message.job);

        let step = self.scheduler.attempt_finished(message.job, message.outcome);
        self.apply(step);

        if self.cancel_deadline.is_some() && self.scheduler.running_count() == 0 {
            self.cancel_deadline = None;
        }
    }

    fn on_cancel(&mut self) {
        let (step, running) = self.scheduler.cancel();
        if step.is_empty() && running.is_empty() {
            return;
        }
        info!(run_id = %self.run_id, running = running.len(), "cancelling run");
        self.apply(step);

        for job in &running {
            if let Some(worker) = self.workers.get(job) {
                worker.cancel.cancel();
            }
        }
        if !running.is_empty() {
            self.cancel_deadline = Some(Instant::now() + self.cancel_grace);
        }
    }

    fn on_grace_expired(&mut self) {
        self.cancel_deadline = None;
        for job in self.scheduler.running_jobs() {
            warn!(
                run_id = %self.run_id,
                job = %self.scheduler.graph().job(job).name,
                "worker did not acknowledge cancellation in time"
            );
            if let Some(worker) = self.workers.remove(&job) {
                worker.abort.abort();
            }
            let step = self.scheduler.force_cancel(job);
            self.apply(step);
        }
    }

    /// Record a scheduler step in the ledger and start its dispatches
    fn apply(&mut self, step: SchedulerStep) {
        let graph = self.scheduler.graph().clone();

        for transition in step.transitions {
            let job = &graph.job(transition.job).name;
            debug!(job = %job, from = %transition.from, to = %transition.to, "job state changed");
            self.ledger.append(
                self.run_id,
                EventKind::JobStateChanged {
                    job: job.clone(),
                    from: transition.from,
                    to: transition.to,
                    reason: transition.reason,
                },
            );
        }

        for retry in step.retries {
            let job = &graph.job(retry.job).name;
            info!(
                job = %job,
                attempt = retry.attempt,
                delay_ms = retry.delay.as_millis() as u64,
                reason = %retry.reason,
                "retrying job"
            );
            self.ledger.append(
                self.run_id,
                EventKind::JobRetrying {
                    job: job.clone(),
                    attempt: retry.attempt,
                    delay_ms: retry.delay.as_millis() as u64,
                    reason: retry.reason,
                },
            );
        }

        for dispatch in step.dispatched {
            self.spawn_worker(dispatch);
        }
    }

    fn spawn_worker(&mut self, dispatch: Dispatch) {
        let Dispatch { job, attempt, delay } = dispatch;
        let (cancel, signal) = CancelSignal::pair();
        let runner = self.runner.clone();

        let attempt_task = tokio::spawn(async move {
            if !delay.is_zero() {
                let mut waiting = signal.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = waiting.cancelled() => return AttemptOutcome::Cancelled,
                }
            }
            runner.run(job, attempt, signal).await
        });
        let abort = attempt_task.abort_handle();

        // Supervisor: turns a panicked attempt into a report
        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let outcome = match attempt_task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => return,
                Err(e) => AttemptOutcome::Failed(FailureReason::WorkerLost {
                    message: e.to_string(),
                }),
            };
            let _ = tx.send(WorkerMessage { job, attempt, outcome });
        });

        self.workers.insert(job, Worker { attempt, cancel, abort });
    }
}
