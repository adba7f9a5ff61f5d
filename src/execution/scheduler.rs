//! Run scheduler - decides which jobs run next
//!
//! The scheduler is a pure state machine: it owns the per-run job states and
//! reacts to completions, but never spawns tasks, sleeps or does IO. The
//! engine feeds it events and carries out the [`SchedulerStep`] it returns.

use crate::core::job::JobId;
use crate::core::pipeline::PipelineGraph;
use crate::core::state::{
    AttemptOutcome, CancelReason, FailureReason, JobReason, JobState, RunStatus, SkipReason,
};
use crate::core::trigger::TriggerEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Strategy for scheduling job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Execute jobs in dependency order, one at a time
    Sequential,

    /// Execute all ready jobs in parallel
    Parallel,

    /// Limited parallelism (max N concurrent jobs)
    LimitedParallel(usize),
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::Parallel
    }
}

impl SchedulingStrategy {
    /// Maximum number of jobs running at once; `None` is unbounded
    pub fn capacity(&self) -> Option<usize> {
        match self {
            SchedulingStrategy::Sequential => Some(1),
            SchedulingStrategy::Parallel => None,
            SchedulingStrategy::LimitedParallel(max) => Some((*max).max(1)),
        }
    }
}

/// A job state change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
    pub reason: Option<JobReason>,
}

/// A job attempt to start on a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub job: JobId,
    pub attempt: u32,

    /// Wait this long before the attempt starts
    pub delay: Duration,
}

/// A failed attempt that will be retried
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    pub job: JobId,
    pub attempt: u32,
    pub delay: Duration,
    pub reason: FailureReason,
}

/// Everything that changed in reaction to one input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStep {
    /// State changes, in the order they happened
    pub transitions: Vec<Transition>,

    /// Attempts to start, including retries
    pub dispatched: Vec<Dispatch>,

    /// Retries decided in this step
    pub retries: Vec<Retry>,
}

impl SchedulerStep {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.dispatched.is_empty() && self.retries.is_empty()
    }
}

/// Per-run scheduling state
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<PipelineGraph>,
    states: Vec<JobState>,
    reasons: Vec<Option<JobReason>>,

    /// Unfinished dependencies per job
    remaining: Vec<usize>,

    /// Attempts started per job
    attempts: Vec<u32>,

    /// Jobs waiting for a slot, oldest first
    runnable: VecDeque<JobId>,

    running: usize,
    group_running: HashMap<String, usize>,
    capacity: Option<usize>,

    started: bool,
    cancelled: bool,
}

impl Scheduler {
    /// Create a scheduler for one run of `graph`
    ///
    /// The effective bound is the smaller of the strategy's capacity and the
    /// pipeline's `maxParallel`.
    pub fn new(graph: Arc<PipelineGraph>, strategy: SchedulingStrategy) -> Self {
        let capacity = match (strategy.capacity(), graph.max_parallel()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let n = graph.len();

        Self {
            graph,
            states: vec![JobState::Pending; n],
            reasons: vec![None; n],
            remaining: vec![0; n],
            attempts: vec![0; n],
            runnable: VecDeque::new(),
            running: 0,
            group_running: HashMap::new(),
            capacity,
            started: false,
            cancelled: false,
        }
    }

    pub fn graph(&self) -> &Arc<PipelineGraph> {
        &self.graph
    }

    pub fn state(&self, job: JobId) -> JobState {
        self.states[job.index()]
    }

    pub fn reason(&self, job: JobId) -> Option<&JobReason> {
        self.reasons[job.index()].as_ref()
    }

    pub fn attempts(&self, job: JobId) -> u32 {
        self.attempts[job.index()]
    }

    /// Number of jobs holding a worker slot
    pub fn running_count(&self) -> usize {
        self.running
    }

    /// Number of running jobs in a concurrency group
    pub fn group_running(&self, group: &str) -> usize {
        self.group_running.get(group).copied().unwrap_or(0)
    }

    /// Jobs currently in the Running state
    pub fn running_jobs(&self) -> Vec<JobId> {
        self.jobs_in(JobState::Running)
    }

    pub fn jobs_in(&self, state: JobState) -> Vec<JobId> {
        self.graph
            .jobs()
            .iter()
            .map(|j| j.id)
            .filter(|id| self.states[id.index()] == state)
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn transition(&mut self, job: JobId, to: JobState, reason: Option<JobReason>, step: &mut SchedulerStep) {
        let from = self.states[job.index()];
        debug_assert!(from.can_transition_to(to), "illegal transition {} -> {}", from, to);
        debug!(job = %self.graph.job(job).name, %from, %to, "job state changed");

        self.states[job.index()] = to;
        if reason.is_some() {
            self.reasons[job.index()] = reason.clone();
        }
        step.transitions.push(Transition { job, from, to, reason });
    }

    /// Evaluate triggers and release the jobs without dependencies
    pub fn start(&mut self, event: &TriggerEvent) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.started {
            return step;
        }
        self.started = true;

        let ids: Vec<JobId> = self.graph.jobs().iter().map(|j| j.id).collect();
        for &id in &ids {
            if !self.graph.job(id).trigger.matches(event) {
                self.transition(
                    id,
                    JobState::Skipped,
                    Some(JobReason::Skipped(SkipReason::TriggerMismatch)),
                    &mut step,
                );
            }
        }

        for &id in &ids {
            if self.states[id.index()] != JobState::Pending {
                continue;
            }
            // Dependencies skipped by their trigger do not count
            let remaining = self
                .graph
                .job(id)
                .dependencies
                .iter()
                .filter(|dep| self.states[dep.index()] != JobState::Skipped)
                .count();
            self.remaining[id.index()] = remaining;

            if remaining == 0 {
                self.transition(id, JobState::Runnable, None, &mut step);
                self.runnable.push_back(id);
            } else {
                self.transition(id, JobState::Blocked, None, &mut step);
            }
        }

        self.fill_slots(&mut step);
        step
    }

    fn group_has_room(&self, job: JobId) -> bool {
        let Some(group) = &self.graph.job(job).concurrency_group else {
            return true;
        };
        match self.graph.group_limit(group) {
            Some(limit) => self.group_running(group) < limit,
            None => true,
        }
    }

    /// Dispatch runnable jobs, oldest first, while capacity allows
    fn fill_slots(&mut self, step: &mut SchedulerStep) {
        if self.cancelled {
            return;
        }

        let mut deferred = Vec::new();
        while let Some(id) = self.runnable.pop_front() {
            if self.capacity.is_some_and(|cap| self.running >= cap) {
                self.runnable.push_front(id);
                break;
            }
            if !self.group_has_room(id) {
                deferred.push(id);
                continue;
            }

            self.running += 1;
            if let Some(group) = self.graph.job(id).concurrency_group.clone() {
                *self.group_running.entry(group).or_insert(0) += 1;
            }
            self.attempts[id.index()] = 1;
            self.transition(id, JobState::Running, None, step);
            step.dispatched.push(Dispatch {
                job: id,
                attempt: 1,
                delay: Duration::ZERO,
            });
        }

        for id in deferred.into_iter().rev() {
            self.runnable.push_front(id);
        }
    }

    fn release_slot(&mut self, job: JobId) {
        self.running = self.running.saturating_sub(1);
        if let Some(group) = &self.graph.job(job).concurrency_group {
            if let Some(count) = self.group_running.get_mut(group) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Record the outcome of a job attempt
    pub fn attempt_finished(&mut self, job: JobId, outcome: AttemptOutcome) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.states[job.index()] != JobState::Running {
            warn!(job = %self.graph.job(job).name, state = %self.states[job.index()], "ignoring outcome of job that is not running");
            return step;
        }

        let (to, reason) = match outcome {
            _ if self.cancelled => (
                JobState::Cancelled,
                Some(JobReason::Cancelled(CancelReason::Requested)),
            ),
            AttemptOutcome::Succeeded => (JobState::Succeeded, None),
            AttemptOutcome::Cancelled => (
                JobState::Cancelled,
                Some(JobReason::Cancelled(CancelReason::Requested)),
            ),
            AttemptOutcome::Failed(reason) => {
                let job_def = self.graph.job(job);
                let attempt = self.attempts[job.index()];
                if reason.is_retryable() && job_def.retry.allows_another(attempt) {
                    let next = attempt + 1;
                    let delay = job_def.retry.backoff.delay_before(next);
                    self.attempts[job.index()] = next;
                    step.retries.push(Retry {
                        job,
                        attempt: next,
                        delay,
                        reason,
                    });
                    step.dispatched.push(Dispatch {
                        job,
                        attempt: next,
                        delay,
                    });
                    return step;
                }
                (JobState::Failed, Some(JobReason::Failed(reason)))
            }
        };

        self.finish(job, to, reason, &mut step);
        step
    }

    /// Mark a running job cancelled without waiting for its worker
    pub fn force_cancel(&mut self, job: JobId) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.states[job.index()] == JobState::Running {
            self.finish(
                job,
                JobState::Cancelled,
                Some(JobReason::Cancelled(CancelReason::CancellationTimeout)),
                &mut step,
            );
        }
        step
    }

    fn finish(&mut self, job: JobId, to: JobState, reason: Option<JobReason>, step: &mut SchedulerStep) {
        self.release_slot(job);
        self.transition(job, to, reason, step);
        self.resolve_dependents(job, step);
        self.fill_slots(step);
    }

    /// Propagate a terminal job to its direct dependents, transitively for skips and cancels
    fn resolve_dependents(&mut self, finished: JobId, step: &mut SchedulerStep) {
        let mut worklist = vec![finished];

        while let Some(done) = worklist.pop() {
            let done_job = self.graph.job(done);
            let done_state = self.states[done.index()];
            let satisfied = done_state == JobState::Succeeded
                || (matches!(done_state, JobState::Failed | JobState::Skipped) && done_job.allow_failure);
            let done_name = done_job.name.clone();

            let dependents = self.graph.dependents(done).to_vec();
            for dependent in dependents {
                if self.states[dependent.index()] != JobState::Blocked {
                    continue;
                }

                if satisfied {
                    self.remaining[dependent.index()] -= 1;
                    if self.remaining[dependent.index()] == 0 {
                        self.transition(dependent, JobState::Runnable, None, step);
                        self.runnable.push_back(dependent);
                    }
                } else if done_state == JobState::Cancelled {
                    let reason = CancelReason::DependencyCancelled {
                        dependency: done_name.clone(),
                    };
                    self.transition(dependent, JobState::Cancelled, Some(JobReason::Cancelled(reason)), step);
                    worklist.push(dependent);
                } else {
                    let reason = SkipReason::DependencyFailed {
                        dependency: done_name.clone(),
                    };
                    self.transition(dependent, JobState::Skipped, Some(JobReason::Skipped(reason)), step);
                    worklist.push(dependent);
                }
            }
        }
    }

    /// Cancel the run
    ///
    /// Jobs that are not running are cancelled at once. Running jobs are
    /// returned; they become Cancelled when their worker reports back or via
    /// [`Scheduler::force_cancel`].
    pub fn cancel(&mut self) -> (SchedulerStep, Vec<JobId>) {
        let mut step = SchedulerStep::default();
        if self.cancelled || self.is_terminal() {
            return (step, Vec::new());
        }
        self.cancelled = true;
        self.runnable.clear();

        let ids: Vec<JobId> = self.graph.jobs().iter().map(|j| j.id).collect();
        for id in ids {
            if matches!(
                self.states[id.index()],
                JobState::Pending | JobState::Blocked | JobState::Runnable
            ) {
                self.transition(
                    id,
                    JobState::Cancelled,
                    Some(JobReason::Cancelled(CancelReason::Requested)),
                    &mut step,
                );
            }
        }

        (step, self.running_jobs())
    }

    /// Whether every job reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.started && self.states.iter().all(JobState::is_terminal)
    }

    /// Overall status of the run
    pub fn run_status(&self) -> RunStatus {
        if !self.started {
            return RunStatus::Pending;
        }
        if !self.is_terminal() {
            return RunStatus::Running;
        }
        if self.cancelled {
            return RunStatus::Cancelled;
        }

        let ok = self.graph.jobs().iter().all(|job| match self.states[job.id.index()] {
            JobState::Succeeded => true,
            JobState::Skipped => matches!(
                self.reasons[job.id.index()],
                Some(JobReason::Skipped(SkipReason::TriggerMismatch))
            ),
            JobState::Failed => job.allow_failure,
            _ => false,
        });

        if ok {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }
}
