//! Step executors - where a step's command actually runs
//!
//! The engine only ever talks to [`StepExecutor`]; the compute runtime behind
//! it (a local shell, a container runtime, a remote agent) is interchangeable.

pub mod shell;

use crate::core::job::Step;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

pub use shell::ShellExecutor;

/// Errors raised by an executor while running a step
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn step: {0}")]
    Spawn(String),

    #[error("step action is not supported by this executor: {0}")]
    Unsupported(String),

    #[error("step was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal executor error: {0}")]
    Internal(String),
}

/// Everything an executor needs to know about where a step runs
#[derive(Debug, Clone)]
pub struct StepEnv {
    pub run_id: Uuid,
    pub pipeline: String,
    pub job: String,
    pub step: String,
    pub attempt: u32,

    /// Working directory for the step
    pub workspace: PathBuf,

    /// Environment variables exported to the step
    pub vars: BTreeMap<String, String>,
}

/// An artifact handed back by an executor, stored by the job runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub name: String,
    pub content: Vec<u8>,
}

/// Result of running a step to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Process exit code; `0` is success
    pub exit_code: i32,

    /// Artifacts produced by the step
    pub artifacts: Vec<ProducedArtifact>,

    /// Output lines, in the order they were produced
    pub logs: Vec<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    pub fn with_artifact(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.artifacts.push(ProducedArtifact {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Cooperative cancellation signal handed to every worker
///
/// Cloning is cheap; all clones observe the same request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a [`CancelSignal`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// Create a connected handle/signal pair
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, signal) = Self::pair();
        signal
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested
    ///
    /// If the handle is dropped without cancelling, this never resolves.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Trait for step execution - allows for different compute backends
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one step to completion
    ///
    /// Commands arrive with variables already rendered. Implementations must
    /// stop promptly and return [`ExecutorError::Cancelled`] once `cancel` fires.
    async fn execute(
        &self,
        step: &Step,
        env: &StepEnv,
        cancel: CancelSignal,
    ) -> Result<StepOutcome, ExecutorError>;
}
