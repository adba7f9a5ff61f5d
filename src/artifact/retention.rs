//! Background garbage collection of expired artifacts

use crate::artifact::ArtifactStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodically removes expired artifacts on its own task
///
/// Runs never wait on collection; the engine only stamps retention when a
/// run finishes.
pub struct RetentionCollector {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RetentionCollector {
    /// Start collecting every `interval`
    pub fn spawn(store: Arc<dyn ArtifactStore>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.collect_expired(Utc::now()).await {
                            Ok(0) => debug!("no expired artifacts"),
                            Ok(removed) => info!(removed, "collected expired artifacts"),
                            Err(e) => warn!(error = %e, "artifact collection failed"),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Stop the collector and wait for the current pass to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "retention collector task failed");
        }
    }
}

impl Drop for RetentionCollector {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.handle.abort();
        }
    }
}
