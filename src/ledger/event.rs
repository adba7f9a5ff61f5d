//! Run events

use crate::artifact::ArtifactRef;
use crate::core::state::{FailureReason, JobReason, JobState, RunStatus};
use crate::core::trigger::TriggerEvent;
use crate::gate::GateResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of a run's append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,

    /// Position in the run's log, starting at 0
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: EventKind,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        pipeline: String,
        event: TriggerEvent,
        /// Job names in declaration order
        jobs: Vec<String>,
    },
    JobStateChanged {
        job: String,
        from: JobState,
        to: JobState,
        reason: Option<JobReason>,
    },
    JobRetrying {
        job: String,
        /// Attempt about to start
        attempt: u32,
        delay_ms: u64,
        reason: FailureReason,
    },
    StepStarted {
        job: String,
        step: String,
        attempt: u32,
    },
    StepFinished {
        job: String,
        step: String,
        exit_code: i32,
    },
    LogLine {
        job: String,
        step: String,
        line: String,
    },
    GateEvaluated {
        job: String,
        gate: String,
        result: GateResult,
    },
    ArtifactStored {
        job: String,
        artifact: ArtifactRef,
    },
    RunFinished {
        status: RunStatus,
    },
}

impl EventKind {
    /// Job the event belongs to, if any
    pub fn job(&self) -> Option<&str> {
        match self {
            EventKind::JobStateChanged { job, .. }
            | EventKind::JobRetrying { job, .. }
            | EventKind::StepStarted { job, .. }
            | EventKind::StepFinished { job, .. }
            | EventKind::LogLine { job, .. }
            | EventKind::GateEvaluated { job, .. }
            | EventKind::ArtifactStored { job, .. } => Some(job),
            EventKind::RunStarted { .. } | EventKind::RunFinished { .. } => None,
        }
    }

    pub fn is_run_finished(&self) -> bool {
        matches!(self, EventKind::RunFinished { .. })
    }
}
