//! In-memory artifact store (for tests or ephemeral runs)

use crate::artifact::{
    check_name, ArtifactError, ArtifactRef, ArtifactStore, OverwritePolicy, RetentionPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct RunArtifacts {
    artifacts: BTreeMap<String, (ArtifactRef, Arc<Vec<u8>>)>,

    /// Set once the run finished: the expiry, or `None` to keep forever
    retained: Option<Option<DateTime<Utc>>>,
}

/// Artifact store keeping every blob in memory
#[derive(Default)]
pub struct InMemoryArtifactStore {
    runs: RwLock<HashMap<Uuid, RunArtifacts>>,
    overwrite: OverwritePolicy,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, run_id: Uuid, name: &str, content: Vec<u8>) -> Result<ArtifactRef, ArtifactError> {
        check_name(name)?;
        let mut runs = self.runs.write().await;
        let run = runs.entry(run_id).or_default();

        if self.overwrite == OverwritePolicy::Reject && run.artifacts.contains_key(name) {
            return Err(ArtifactError::AlreadyExists {
                run_id,
                name: name.to_string(),
            });
        }

        let artifact = ArtifactRef::describe(run_id, name, &content);
        debug!(%run_id, artifact = name, size = artifact.size, "stored artifact");
        run.artifacts
            .insert(name.to_string(), (artifact.clone(), Arc::new(content)));
        Ok(artifact)
    }

    async fn get(&self, run_id: Uuid, name: &str) -> Result<Vec<u8>, ArtifactError> {
        let runs = self.runs.read().await;
        runs.get(&run_id)
            .and_then(|run| run.artifacts.get(name))
            .map(|(_, content)| content.as_ref().clone())
            .ok_or_else(|| ArtifactError::NotFound {
                run_id,
                name: name.to_string(),
            })
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<ArtifactRef>, ArtifactError> {
        let runs = self.runs.read().await;
        Ok(runs
            .get(&run_id)
            .map(|run| run.artifacts.values().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn retain(&self, run_id: Uuid, policy: RetentionPolicy) -> Result<(), ArtifactError> {
        let mut runs = self.runs.write().await;
        runs.entry(run_id).or_default().retained = Some(policy.expires_at(Utc::now()));
        Ok(())
    }

    async fn collect_expired(&self, now: DateTime<Utc>) -> Result<usize, ArtifactError> {
        let mut runs = self.runs.write().await;
        let mut removed = 0;
        runs.retain(|run_id, run| match run.retained {
            Some(Some(expires_at)) if expires_at <= now => {
                debug!(%run_id, count = run.artifacts.len(), "collecting expired artifacts");
                removed += run.artifacts.len();
                false
            }
            _ => true,
        });
        Ok(removed)
    }
}
