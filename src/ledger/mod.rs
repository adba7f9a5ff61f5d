//! Run ledger - append-only event logs and status queries
//!
//! Every run owns one log. Writers append; readers either fold the log into a
//! [`RunSnapshot`] or follow it with an [`EventStream`]. Once `RunFinished` is
//! appended the log is sealed, so snapshots of finished runs never change.

pub mod event;
pub mod snapshot;

pub use event::{EventKind, RunEvent};
pub use snapshot::{JobSnapshot, RunSnapshot};

use chrono::Utc;
use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

#[derive(Default)]
struct LogState {
    events: Vec<RunEvent>,
    sealed: bool,
}

#[derive(Default)]
struct RunLog {
    state: Mutex<LogState>,
    notify: Notify,
}

impl RunLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the event logs of all runs; cheap to clone
#[derive(Clone, Default)]
pub struct RunLedger {
    runs: Arc<Mutex<HashMap<Uuid, Arc<RunLog>>>>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, run_id: Uuid) -> Option<Arc<RunLog>> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .cloned()
    }

    /// Create the log of a run; a no-op if it already exists
    pub fn open_run(&self, run_id: Uuid) {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(run_id)
            .or_default();
    }

    /// Append an event and return its sequence number
    ///
    /// Opens the run if needed. Appends to a finished run are dropped and
    /// return `None`.
    pub fn append(&self, run_id: Uuid, kind: EventKind) -> Option<u64> {
        self.open_run(run_id);
        let log = self.log(run_id)?;

        let seq = {
            let mut state = log.lock();
            if state.sealed {
                warn!(%run_id, event = ?kind, "dropping event appended after run finished");
                return None;
            }
            let seq = state.events.len() as u64;
            state.sealed = kind.is_run_finished();
            state.events.push(RunEvent {
                run_id,
                seq,
                timestamp: Utc::now(),
                kind,
            });
            seq
        };

        log.notify.notify_waiters();
        Some(seq)
    }

    /// Fold the log of a run into a snapshot
    pub fn query(&self, run_id: Uuid) -> Option<RunSnapshot> {
        let log = self.log(run_id)?;
        let state = log.lock();
        Some(RunSnapshot::fold(run_id, &state.events))
    }

    /// Copy of the events of a run starting at offset `from`
    pub fn events(&self, run_id: Uuid, from: usize) -> Vec<RunEvent> {
        self.log(run_id)
            .map(|log| log.lock().events.iter().skip(from).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the run finished
    pub fn is_finished(&self, run_id: Uuid) -> bool {
        self.log(run_id).is_some_and(|log| log.lock().sealed)
    }

    /// Ids of all known runs
    pub fn runs(&self) -> Vec<Uuid> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Drop the log of a finished run
    ///
    /// Live runs are kept; returns whether the log was removed. Streams that
    /// already follow the run keep their copy until they are dropped.
    pub fn forget_run(&self, run_id: Uuid) -> bool {
        let mut runs = self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match runs.get(&run_id) {
            Some(log) if log.lock().sealed => {
                runs.remove(&run_id);
                true
            }
            _ => false,
        }
    }

    /// Follow the log of a run from offset `from`
    ///
    /// The stream ends after the last event of a finished run. Unknown runs
    /// are opened, so a subscriber may attach before the run starts.
    pub fn stream(&self, run_id: Uuid, from: usize) -> EventStream {
        self.open_run(run_id);
        EventStream {
            log: self.log(run_id),
            next: from,
        }
    }
}

/// Live view over a run's event log
pub struct EventStream {
    log: Option<Arc<RunLog>>,
    next: usize,
}

impl EventStream {
    /// Next event, waiting for it if necessary; `None` once the run finished
    pub async fn next(&mut self) -> Option<RunEvent> {
        let log = self.log.clone()?;
        loop {
            let mut notified = pin!(log.notify.notified());
            {
                let state = log.lock();
                if let Some(event) = state.events.get(self.next) {
                    self.next += 1;
                    return Some(event.clone());
                }
                if state.sealed {
                    return None;
                }
                // Register before releasing the lock so no append is missed
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Offset of the next event to be returned
    pub fn position(&self) -> usize {
        self.next
    }

    /// Adapt into a `Stream` by forwarding on a background task
    pub fn into_stream(mut self) -> ReceiverStream<RunEvent> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(event) = self.next().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
