//! Point-in-time views of a run, folded from its event log

use crate::artifact::ArtifactRef;
use crate::core::state::{JobReason, JobState, RunStatus};
use crate::core::trigger::TriggerEvent;
use crate::gate::GateResult;
use crate::ledger::event::{EventKind, RunEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of one job as seen by observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub name: String,
    pub state: JobState,
    pub reason: Option<JobReason>,

    /// Highest attempt started so far
    pub attempts: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Step currently executing
    pub current_step: Option<String>,

    pub gate: Option<GateResult>,
    pub log_lines: usize,
}

impl JobSnapshot {
    fn new(name: String) -> Self {
        Self {
            name,
            state: JobState::Pending,
            reason: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            current_step: None,
            gate: None,
            log_lines: 0,
        }
    }
}

/// State of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub event: Option<TriggerEvent>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Jobs in declaration order
    pub jobs: Vec<JobSnapshot>,

    pub artifacts: Vec<ArtifactRef>,

    /// Number of events folded into this snapshot
    pub event_count: usize,
}

impl RunSnapshot {
    /// Fold an event log into a snapshot
    pub fn fold(run_id: Uuid, events: &[RunEvent]) -> Self {
        let mut snapshot = Self {
            run_id,
            pipeline: String::new(),
            status: RunStatus::Pending,
            event: None,
            started_at: None,
            finished_at: None,
            jobs: Vec::new(),
            artifacts: Vec::new(),
            event_count: 0,
        };
        for event in events {
            snapshot.apply(event);
        }
        snapshot
    }

    fn job_mut(&mut self, name: &str) -> &mut JobSnapshot {
        match self.jobs.iter().position(|j| j.name == name) {
            Some(i) => &mut self.jobs[i],
            None => {
                self.jobs.push(JobSnapshot::new(name.to_string()));
                let last = self.jobs.len() - 1;
                &mut self.jobs[last]
            }
        }
    }

    fn apply(&mut self, event: &RunEvent) {
        self.event_count += 1;
        let at = event.timestamp;

        match &event.kind {
            EventKind::RunStarted { pipeline, event, jobs } => {
                self.pipeline = pipeline.clone();
                self.event = Some(event.clone());
                self.status = RunStatus::Running;
                self.started_at = Some(at);
                self.jobs = jobs.iter().cloned().map(JobSnapshot::new).collect();
            }
            EventKind::JobStateChanged { job, to, reason, .. } => {
                let job = self.job_mut(job);
                job.state = *to;
                if reason.is_some() {
                    job.reason = reason.clone();
                }
                if *to == JobState::Running && job.started_at.is_none() {
                    job.started_at = Some(at);
                }
                if to.is_terminal() {
                    job.finished_at = Some(at);
                    job.current_step = None;
                }
            }
            EventKind::JobRetrying { job, .. } => {
                self.job_mut(job).current_step = None;
            }
            EventKind::StepStarted { job, step, attempt } => {
                let job = self.job_mut(job);
                job.attempts = job.attempts.max(*attempt);
                job.current_step = Some(step.clone());
            }
            EventKind::StepFinished { job, .. } => {
                self.job_mut(job).current_step = None;
            }
            EventKind::LogLine { job, .. } => {
                self.job_mut(job).log_lines += 1;
            }
            EventKind::GateEvaluated { job, result, .. } => {
                self.job_mut(job).gate = Some(*result);
            }
            EventKind::ArtifactStored { artifact, .. } => {
                self.artifacts.push(artifact.clone());
            }
            EventKind::RunFinished { status } => {
                self.status = *status;
                self.finished_at = Some(at);
            }
        }
    }

    /// Look up a job by name
    pub fn job(&self, name: &str) -> Option<&JobSnapshot> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Number of jobs currently in `state`
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
