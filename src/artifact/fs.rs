//! Filesystem artifact store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<run_id>/data/<name>         content
//! <root>/<run_id>/meta/<name>.json    ArtifactRef
//! <root>/<run_id>/staging/            partial writes, renamed into place
//! <root>/<run_id>/retention.json      written when the run finished
//! ```

use crate::artifact::{
    check_name, ArtifactError, ArtifactRef, ArtifactStore, OverwritePolicy, RetentionPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const RETENTION_FILE: &str = "retention.json";

#[derive(Debug, Serialize, Deserialize)]
struct RetentionRecord {
    finished_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

/// Artifact store backed by a directory tree
pub struct FsArtifactStore {
    root: PathBuf,
    overwrite: OverwritePolicy,

    /// Serializes writers so the existence check and the write are atomic
    write_lock: Mutex<()>,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overwrite: OverwritePolicy::default(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store in the default data directory (`<data_local_dir>/runway/artifacts`)
    pub fn with_default_path() -> Self {
        let root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("runway")
            .join("artifacts");
        Self::new(root)
    }

    pub fn with_overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn data_path(&self, run_id: Uuid, name: &str) -> PathBuf {
        self.run_dir(run_id).join("data").join(name)
    }

    fn meta_path(&self, run_id: Uuid, name: &str) -> PathBuf {
        self.run_dir(run_id).join("meta").join(format!("{}.json", name))
    }

    fn staging_path(&self, run_id: Uuid, file: &str) -> PathBuf {
        self.run_dir(run_id).join("staging").join(file)
    }

    /// Write `bytes` to `staging` and rename it to `target`
    async fn write_atomic(staging: &Path, target: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
        fs::write(staging, bytes).await?;
        if let Err(e) = fs::rename(staging, target).await {
            let _ = fs::remove_file(staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn count_artifacts(run_dir: &Path) -> Result<usize, ArtifactError> {
        let mut count = 0;
        let mut entries = match fs::read_dir(run_dir.join("meta")).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, run_id: Uuid, name: &str, content: Vec<u8>) -> Result<ArtifactRef, ArtifactError> {
        check_name(name)?;
        let _guard = self.write_lock.lock().await;

        let meta_path = self.meta_path(run_id, name);
        if self.overwrite == OverwritePolicy::Reject && fs::try_exists(&meta_path).await? {
            return Err(ArtifactError::AlreadyExists {
                run_id,
                name: name.to_string(),
            });
        }

        let data_path = self.data_path(run_id, name);
        let data_staging = self.staging_path(run_id, name);
        let meta_staging = self.staging_path(run_id, &format!("{}.json", name));
        for path in [&data_path, &meta_path, &data_staging] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }

        let artifact = ArtifactRef::describe(run_id, name, &content);
        Self::write_atomic(&data_staging, &data_path, &content).await?;
        // Metadata last: an artifact exists once its sidecar does
        let meta = serde_json::to_vec_pretty(&artifact)?;
        Self::write_atomic(&meta_staging, &meta_path, &meta).await?;

        debug!(%run_id, artifact = name, path = %data_path.display(), "stored artifact");
        Ok(artifact)
    }

    async fn get(&self, run_id: Uuid, name: &str) -> Result<Vec<u8>, ArtifactError> {
        check_name(name)?;
        let not_found = || ArtifactError::NotFound {
            run_id,
            name: name.to_string(),
        };

        if !fs::try_exists(self.meta_path(run_id, name)).await? {
            return Err(not_found());
        }
        match fs::read(self.data_path(run_id, name)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<ArtifactRef>, ArtifactError> {
        let mut entries = match fs::read_dir(self.run_dir(run_id).join("meta")).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let bytes = fs::read(&path).await?;
                artifacts.push(serde_json::from_slice::<ArtifactRef>(&bytes)?);
            }
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    async fn retain(&self, run_id: Uuid, policy: RetentionPolicy) -> Result<(), ArtifactError> {
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir).await?;

        let finished_at = Utc::now();
        let record = RetentionRecord {
            finished_at,
            expires_at: policy.expires_at(finished_at),
        };
        fs::write(run_dir.join(RETENTION_FILE), serde_json::to_vec_pretty(&record)?).await?;
        Ok(())
    }

    async fn collect_expired(&self, now: DateTime<Utc>) -> Result<usize, ArtifactError> {
        let _guard = self.write_lock.lock().await;

        let mut runs = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = runs.next_entry().await? {
            let run_dir = entry.path();
            let record = match fs::read(run_dir.join(RETENTION_FILE)).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let record: RetentionRecord = match serde_json::from_slice(&record) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %run_dir.display(), error = %e, "unreadable retention record; skipping");
                    continue;
                }
            };

            if record.expires_at.is_some_and(|expires_at| expires_at <= now) {
                let count = Self::count_artifacts(&run_dir).await?;
                fs::remove_dir_all(&run_dir).await?;
                debug!(path = %run_dir.display(), count, "collected expired artifacts");
                removed += count;
            }
        }
        Ok(removed)
    }
}
