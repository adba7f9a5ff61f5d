//! Quality gates
//!
//! A gate result is keyed by `(run_id, job)`. External systems (or internal
//! gate commands) report checks through [`GateEvaluator::evaluate`]; gate
//! steps block on [`GateEvaluator::await_verdict`] until a decision arrives.

use crate::executor::CancelSignal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Status reported by an external check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalCheck {
    Passed,
    Failed,
    Pending,
}

impl FromStr for ExternalCheck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" | "passed" | "ok" | "success" => Ok(ExternalCheck::Passed),
            "fail" | "failed" | "failure" | "error" => Ok(ExternalCheck::Failed),
            "pending" => Ok(ExternalCheck::Pending),
            other => Err(format!("unknown check status: {}", other)),
        }
    }
}

/// Gate result for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateResult {
    Pass,
    Fail,
    Pending,
}

impl GateResult {
    pub fn is_decided(&self) -> bool {
        !matches!(self, GateResult::Pending)
    }
}

impl From<ExternalCheck> for GateResult {
    fn from(check: ExternalCheck) -> Self {
        match check {
            ExternalCheck::Passed => GateResult::Pass,
            ExternalCheck::Failed => GateResult::Fail,
            ExternalCheck::Pending => GateResult::Pending,
        }
    }
}

impl fmt::Display for GateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateResult::Pass => "pass",
            GateResult::Fail => "fail",
            GateResult::Pending => "pending",
        };
        f.write_str(name)
    }
}

/// Outcome of waiting on a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Fail,
    /// Still pending when the timeout elapsed
    TimedOut,
    /// The waiting job was cancelled
    Cancelled,
}

type GateKey = (Uuid, String);

/// Shared gate state; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct GateEvaluator {
    slots: Arc<Mutex<HashMap<GateKey, watch::Sender<GateResult>>>>,
}

impl GateEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<GateKey, watch::Sender<GateResult>>> {
        // A poisoned map still holds consistent senders
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an external check for a job and return the resulting gate state
    ///
    /// The first `Pass` or `Fail` for a key is final; later reports are ignored.
    pub fn evaluate(&self, run_id: Uuid, job: &str, check: ExternalCheck) -> GateResult {
        let next = GateResult::from(check);
        let mut slots = self.lock();
        let slot = slots
            .entry((run_id, job.to_string()))
            .or_insert_with(|| watch::channel(GateResult::Pending).0);

        let changed = slot.send_if_modified(|current| {
            if !current.is_decided() && next.is_decided() {
                *current = next;
                true
            } else {
                false
            }
        });
        let result = *slot.borrow();

        if changed {
            info!(%run_id, job, result = %result, "gate decided");
        } else if next.is_decided() && next != result {
            debug!(%run_id, job, ignored = %next, result = %result, "gate already decided");
        }
        result
    }

    /// Current gate state of a job; `Pending` when nothing was reported
    pub fn result(&self, run_id: Uuid, job: &str) -> GateResult {
        self.lock()
            .get(&(run_id, job.to_string()))
            .map(|slot| *slot.borrow())
            .unwrap_or(GateResult::Pending)
    }

    /// Wait until the gate of a job is decided, the timeout elapses, or the job is cancelled
    pub async fn await_verdict(
        &self,
        run_id: Uuid,
        job: &str,
        timeout: Duration,
        mut cancel: CancelSignal,
    ) -> GateVerdict {
        let mut rx = {
            let mut slots = self.lock();
            slots
                .entry((run_id, job.to_string()))
                .or_insert_with(|| watch::channel(GateResult::Pending).0)
                .subscribe()
        };

        let decided = async move {
            loop {
                let current = *rx.borrow_and_update();
                match current {
                    GateResult::Pass => return GateVerdict::Pass,
                    GateResult::Fail => return GateVerdict::Fail,
                    GateResult::Pending => {}
                }
                if rx.changed().await.is_err() {
                    // Slot dropped by clear_run; nothing can decide it anymore
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            verdict = tokio::time::timeout(timeout, decided) => {
                verdict.unwrap_or(GateVerdict::TimedOut)
            }
            _ = cancel.cancelled() => GateVerdict::Cancelled,
        }
    }

    /// Forget the gate slots of a finished run
    pub fn clear_run(&self, run_id: Uuid) {
        self.lock().retain(|(id, _), _| *id != run_id);
    }
}
