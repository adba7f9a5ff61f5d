//! Execution state models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job within a run
///
/// ```text
/// Pending -> Blocked <-> Runnable -> Running -> Succeeded | Failed
///    |          |           |           |
///    +----------+-----------+-----------+--> Cancelled
///               +--> Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Run not started yet
    Pending,
    /// Waiting for dependencies
    Blocked,
    /// Dependencies satisfied, waiting for a worker slot
    Runnable,
    /// Dispatched to a worker (possibly between retry attempts)
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Blocked | Runnable | Skipped | Cancelled) => true,
            (Blocked, Runnable | Skipped | Cancelled) => true,
            (Runnable, Blocked | Running | Cancelled) => true,
            (Running, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Blocked => "blocked",
            JobState::Runnable => "runnable",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Run is in progress
    Running,
    /// Every job succeeded, was skipped by its trigger, or failed with allowFailure
    Succeeded,
    /// At least one job failed
    Failed,
    /// Run was cancelled
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// Process exit code surfaced to the caller of a full run
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Cancelled => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a job attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A step exited non-zero
    StepFailure { step: String, exit_code: i32 },
    /// The gate verdict was Fail
    GateFailure { gate: String },
    /// The gate stayed Pending past its timeout
    GateTimeout { gate: String },
    /// The worker running the job disappeared
    WorkerLost { message: String },
    /// An artifact with the same name already exists in the run
    ArtifactConflict { artifact: String },
    /// A downloaded artifact does not exist
    ArtifactMissing { artifact: String },
    /// A declared output was not stored by the job
    MissingOutput { artifact: String },
    /// The attempt exceeded the job timeout
    Timeout { secs: u64 },
    /// The executor could not run a step
    ExecutorError { message: String },
}

impl FailureReason {
    /// Whether the job's retry policy applies to this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::StepFailure { .. }
                | FailureReason::WorkerLost { .. }
                | FailureReason::Timeout { .. }
                | FailureReason::ExecutorError { .. }
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StepFailure { step, exit_code } => {
                write!(f, "step '{}' exited with code {}", step, exit_code)
            }
            FailureReason::GateFailure { gate } => write!(f, "gate '{}' failed", gate),
            FailureReason::GateTimeout { gate } => write!(f, "gate '{}' timed out while pending", gate),
            FailureReason::WorkerLost { message } => write!(f, "worker lost: {}", message),
            FailureReason::ArtifactConflict { artifact } => {
                write!(f, "artifact '{}' already exists", artifact)
            }
            FailureReason::ArtifactMissing { artifact } => {
                write!(f, "artifact '{}' not found", artifact)
            }
            FailureReason::MissingOutput { artifact } => {
                write!(f, "declared output '{}' was not produced", artifact)
            }
            FailureReason::Timeout { secs } => write!(f, "timed out after {}s", secs),
            FailureReason::ExecutorError { message } => write!(f, "executor error: {}", message),
        }
    }
}

/// Why a job was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The job's trigger did not match the run's event
    TriggerMismatch,
    /// A dependency failed (or was skipped) without allowFailure
    DependencyFailed { dependency: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TriggerMismatch => f.write_str("trigger did not match"),
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{}' did not succeed", dependency)
            }
        }
    }
}

/// Why a job was cancelled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancellation of the run
    Requested,
    /// A dependency was cancelled
    DependencyCancelled { dependency: String },
    /// The worker did not acknowledge cancellation within the grace period
    CancellationTimeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancellation requested"),
            CancelReason::DependencyCancelled { dependency } => {
                write!(f, "dependency '{}' was cancelled", dependency)
            }
            CancelReason::CancellationTimeout => f.write_str("force-cancelled after grace period"),
        }
    }
}

/// Structured reason attached to a terminal job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobReason {
    Failed(FailureReason),
    Skipped(SkipReason),
    Cancelled(CancelReason),
}

impl fmt::Display for JobReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobReason::Failed(reason) => reason.fmt(f),
            JobReason::Skipped(reason) => reason.fmt(f),
            JobReason::Cancelled(reason) => reason.fmt(f),
        }
    }
}

/// Result of one job attempt as reported by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(FailureReason),
    /// The worker stopped because it was signalled to cancel
    Cancelled,
}
