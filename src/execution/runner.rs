//! Job runner - executes the steps of one job attempt on a worker task

use crate::artifact::{content_digest, ArtifactError, ArtifactStore};
use crate::core::context::RunContext;
use crate::core::job::{Job, JobId, Step, StepAction};
use crate::core::pipeline::PipelineGraph;
use crate::core::state::{AttemptOutcome, FailureReason};
use crate::executor::{CancelSignal, ExecutorError, StepEnv, StepExecutor, StepOutcome};
use crate::gate::{ExternalCheck, GateEvaluator, GateResult, GateVerdict};
use crate::ledger::{EventKind, RunLedger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of one step
enum StepResult {
    Ok,
    /// Fails the job unless the step continues on error
    Failed(FailureReason),
    /// Ends the attempt regardless of `continueOnError`
    Abort(AttemptOutcome),
}

impl StepResult {
    /// A failed store; conflicts are fatal to the producing job
    fn from_store_failure(reason: FailureReason) -> Self {
        match reason {
            FailureReason::ArtifactConflict { .. } => StepResult::Abort(AttemptOutcome::Failed(reason)),
            other => StepResult::Failed(other),
        }
    }
}

/// Runs job attempts; shared by all workers of a run
pub(crate) struct JobRunner {
    pub graph: Arc<PipelineGraph>,
    pub ctx: Arc<RunContext>,
    pub executor: Arc<dyn StepExecutor>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub gates: GateEvaluator,
    pub ledger: RunLedger,
    pub workspace: PathBuf,
    pub gate_timeout: Duration,
    pub job_timeout: Option<Duration>,
}

impl JobRunner {
    /// Run one attempt of a job, bounded by the job timeout
    pub async fn run(&self, job_id: JobId, attempt: u32, cancel: CancelSignal) -> AttemptOutcome {
        let job = self.graph.job(job_id);
        info!(run_id = %self.ctx.run_id, job = %job.name, attempt, "starting job attempt");

        let outcome = match job.timeout.or(self.job_timeout) {
            Some(limit) => match tokio::time::timeout(limit, self.run_steps(job, attempt, cancel)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(job = %job.name, secs = limit.as_secs(), "job attempt timed out");
                    AttemptOutcome::Failed(FailureReason::Timeout {
                        secs: limit.as_secs(),
                    })
                }
            },
            None => self.run_steps(job, attempt, cancel).await,
        };

        match &outcome {
            AttemptOutcome::Succeeded => info!(job = %job.name, attempt, "job attempt succeeded"),
            AttemptOutcome::Failed(reason) => warn!(job = %job.name, attempt, %reason, "job attempt failed"),
            AttemptOutcome::Cancelled => info!(job = %job.name, attempt, "job attempt cancelled"),
        }
        outcome
    }

    async fn run_steps(&self, job: &Job, attempt: u32, cancel: CancelSignal) -> AttemptOutcome {
        for step in &job.steps {
            if cancel.is_cancelled() {
                return AttemptOutcome::Cancelled;
            }

            self.ledger.append(
                self.ctx.run_id,
                EventKind::StepStarted {
                    job: job.name.clone(),
                    step: step.name.clone(),
                    attempt,
                },
            );

            let (result, exit_code) = match &step.action {
                StepAction::Run { command } => {
                    self.run_command(job, step, command, attempt, cancel.clone()).await
                }
                StepAction::Upload { artifact, path } => self.upload(job, artifact, path, attempt).await,
                StepAction::Download { artifact, path } => self.download(job, artifact, path).await,
                StepAction::Gate { gate, timeout, command } => {
                    self.gate(job, step, gate, *timeout, command.as_deref(), attempt, cancel.clone())
                        .await
                }
            };

            self.ledger.append(
                self.ctx.run_id,
                EventKind::StepFinished {
                    job: job.name.clone(),
                    step: step.name.clone(),
                    exit_code,
                },
            );

            match result {
                StepResult::Ok => {}
                StepResult::Failed(reason) if step.continue_on_error => {
                    warn!(job = %job.name, step = %step.name, %reason, "step failed; continuing on error");
                }
                StepResult::Failed(reason) => return AttemptOutcome::Failed(reason),
                StepResult::Abort(outcome) => return outcome,
            }
        }

        self.check_outputs(job).await
    }

    fn step_env(&self, job: &Job, step: &Step, attempt: u32) -> StepEnv {
        StepEnv {
            run_id: self.ctx.run_id,
            pipeline: self.ctx.pipeline.clone(),
            job: job.name.clone(),
            step: step.name.clone(),
            attempt,
            workspace: self.workspace.clone(),
            vars: self.ctx.step_env(job, step, attempt),
        }
    }

    /// Run a command through the executor with variables rendered
    async fn execute(
        &self,
        job: &Job,
        step: &Step,
        command: &str,
        attempt: u32,
        cancel: CancelSignal,
    ) -> Result<StepOutcome, ExecutorError> {
        let rendered = Step {
            action: StepAction::Run {
                command: self.ctx.render(command),
            },
            ..step.clone()
        };
        let env = self.step_env(job, step, attempt);
        let outcome = self.executor.execute(&rendered, &env, cancel).await?;

        for line in &outcome.logs {
            self.ledger.append(
                self.ctx.run_id,
                EventKind::LogLine {
                    job: job.name.clone(),
                    step: step.name.clone(),
                    line: line.clone(),
                },
            );
        }
        Ok(outcome)
    }

    async fn run_command(
        &self,
        job: &Job,
        step: &Step,
        command: &str,
        attempt: u32,
        cancel: CancelSignal,
    ) -> (StepResult, i32) {
        let outcome = match self.execute(job, step, command, attempt, cancel).await {
            Ok(outcome) => outcome,
            Err(ExecutorError::Cancelled) => return (StepResult::Abort(AttemptOutcome::Cancelled), -1),
            Err(e) => {
                error!(job = %job.name, step = %step.name, error = %e, "executor error");
                let reason = FailureReason::ExecutorError {
                    message: e.to_string(),
                };
                return (StepResult::Failed(reason), -1);
            }
        };

        for produced in outcome.artifacts {
            if let Err(reason) = self.store(job, &produced.name, produced.content, attempt).await {
                return (StepResult::from_store_failure(reason), outcome.exit_code);
            }
        }

        if outcome.exit_code == 0 {
            (StepResult::Ok, 0)
        } else {
            let reason = FailureReason::StepFailure {
                step: step.name.clone(),
                exit_code: outcome.exit_code,
            };
            (StepResult::Failed(reason), outcome.exit_code)
        }
    }

    /// Store an artifact, accepting an identical copy left by an earlier attempt
    async fn store(&self, job: &Job, name: &str, content: Vec<u8>, attempt: u32) -> Result<(), FailureReason> {
        let digest = content_digest(&content);
        let stored = match self.artifacts.put(self.ctx.run_id, name, content).await {
            Ok(stored) => stored,
            Err(ArtifactError::AlreadyExists { .. }) if attempt > 1 => {
                let existing = self
                    .artifacts
                    .list(self.ctx.run_id)
                    .await
                    .ok()
                    .and_then(|all| all.into_iter().find(|a| a.name == name));
                match existing {
                    Some(existing) if existing.digest == digest => {
                        debug!(job = %job.name, artifact = name, "artifact already stored by an earlier attempt");
                        return Ok(());
                    }
                    _ => {
                        return Err(FailureReason::ArtifactConflict {
                            artifact: name.to_string(),
                        })
                    }
                }
            }
            Err(ArtifactError::AlreadyExists { .. }) => {
                return Err(FailureReason::ArtifactConflict {
                    artifact: name.to_string(),
                })
            }
            Err(e) => {
                return Err(FailureReason::ExecutorError {
                    message: e.to_string(),
                })
            }
        };

        self.ledger.append(
            self.ctx.run_id,
            EventKind::ArtifactStored {
                job: job.name.clone(),
                artifact: stored,
            },
        );
        Ok(())
    }

    async fn upload(&self, job: &Job, artifact: &str, path: &str, attempt: u32) -> (StepResult, i32) {
        let source = self.workspace.join(path);
        let content = match tokio::fs::read(&source).await {
            Ok(content) => content,
            Err(e) => {
                let reason = FailureReason::ExecutorError {
                    message: format!("cannot read {}: {}", source.display(), e),
                };
                return (StepResult::Failed(reason), 1);
            }
        };

        match self.store(job, artifact, content, attempt).await {
            Ok(()) => (StepResult::Ok, 0),
            Err(reason) => (StepResult::from_store_failure(reason), 1),
        }
    }

    async fn download(&self, job: &Job, artifact: &str, path: &str) -> (StepResult, i32) {
        let content = match self.artifacts.get(self.ctx.run_id, artifact).await {
            Ok(content) => content,
            Err(ArtifactError::NotFound { .. }) => {
                let reason = FailureReason::ArtifactMissing {
                    artifact: artifact.to_string(),
                };
                return (StepResult::Failed(reason), 1);
            }
            Err(e) => {
                let reason = FailureReason::ExecutorError {
                    message: e.to_string(),
                };
                return (StepResult::Failed(reason), 1);
            }
        };

        let target = self.workspace.join(path);
        let written = async {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await
        };
        match written.await {
            Ok(()) => {
                debug!(job = %job.name, artifact, path = %target.display(), "downloaded artifact");
                (StepResult::Ok, 0)
            }
            Err(e) => {
                let reason = FailureReason::ExecutorError {
                    message: format!("cannot write {}: {}", target.display(), e),
                };
                (StepResult::Failed(reason), 1)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn gate(
        &self,
        job: &Job,
        step: &Step,
        gate: &str,
        timeout: Option<Duration>,
        command: Option<&str>,
        attempt: u32,
        cancel: CancelSignal,
    ) -> (StepResult, i32) {
        let run_id = self.ctx.run_id;

        // Internal gate: the command's exit code is the check result
        if let Some(command) = command {
            let check = match self.execute(job, step, command, attempt, cancel.clone()).await {
                Ok(outcome) if outcome.is_success() => ExternalCheck::Passed,
                Ok(_) => ExternalCheck::Failed,
                Err(ExecutorError::Cancelled) => return (StepResult::Abort(AttemptOutcome::Cancelled), -1),
                Err(e) => {
                    warn!(job = %job.name, gate, error = %e, "gate command could not run; failing gate");
                    ExternalCheck::Failed
                }
            };
            self.gates.evaluate(run_id, &job.name, check);
        }

        let timeout = timeout
            .or(self.graph.gate_timeout())
            .unwrap_or(self.gate_timeout);
        debug!(job = %job.name, gate, timeout_secs = timeout.as_secs(), "waiting for gate verdict");

        let verdict = self.gates.await_verdict(run_id, &job.name, timeout, cancel).await;
        let recorded = match verdict {
            GateVerdict::Pass => Some(GateResult::Pass),
            GateVerdict::Fail => Some(GateResult::Fail),
            GateVerdict::TimedOut => Some(GateResult::Pending),
            GateVerdict::Cancelled => None,
        };
        if let Some(result) = recorded {
            self.ledger.append(
                run_id,
                EventKind::GateEvaluated {
                    job: job.name.clone(),
                    gate: gate.to_string(),
                    result,
                },
            );
        }

        match verdict {
            GateVerdict::Pass => (StepResult::Ok, 0),
            GateVerdict::Fail => {
                let reason = FailureReason::GateFailure {
                    gate: gate.to_string(),
                };
                (StepResult::Abort(AttemptOutcome::Failed(reason)), 1)
            }
            GateVerdict::TimedOut => {
                let reason = FailureReason::GateTimeout {
                    gate: gate.to_string(),
                };
                (StepResult::Abort(AttemptOutcome::Failed(reason)), 1)
            }
            GateVerdict::Cancelled => (StepResult::Abort(AttemptOutcome::Cancelled), -1),
        }
    }

    /// Every declared output must be in the store once the steps are done
    async fn check_outputs(&self, job: &Job) -> AttemptOutcome {
        if job.outputs.is_empty() {
            return AttemptOutcome::Succeeded;
        }

        let stored = match self.artifacts.list(self.ctx.run_id).await {
            Ok(stored) => stored,
            Err(e) => {
                return AttemptOutcome::Failed(FailureReason::ExecutorError {
                    message: e.to_string(),
                })
            }
        };

        for output in &job.outputs {
            if !stored.iter().any(|a| &a.name == output) {
                return AttemptOutcome::Failed(FailureReason::MissingOutput {
                    artifact: output.clone(),
                });
            }
        }
        AttemptOutcome::Succeeded
    }
}
