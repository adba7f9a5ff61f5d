//! Artifact storage
//!
//! Artifacts are opaque byte blobs keyed by `(run_id, name)`. A reference is
//! only meaningful inside the run that produced it; nothing crosses runs.

pub mod fs;
pub mod memory;
pub mod retention;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use fs::FsArtifactStore;
pub use memory::InMemoryArtifactStore;
pub use retention::RetentionCollector;

/// Default retention window for artifacts of finished runs
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Error types for artifact operations
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact '{name}' not found in run {run_id}")]
    NotFound { run_id: Uuid, name: String },

    #[error("artifact '{name}' already exists in run {run_id}")]
    AlreadyExists { run_id: Uuid, name: String },

    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Metadata describing a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: Uuid,
    pub name: String,

    /// Hex-encoded SHA-256 of the content
    pub digest: String,

    /// Content size in bytes
    pub size: u64,

    pub created_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Describe `content` stored under `(run_id, name)` now
    pub fn describe(run_id: Uuid, name: &str, content: &[u8]) -> Self {
        Self {
            run_id,
            name: name.to_string(),
            digest: content_digest(content),
            size: content.len() as u64,
            created_at: Utc::now(),
        }
    }
}

/// Hex-encoded SHA-256 digest
pub fn content_digest(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// What `put` does when the key already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Artifacts are write-once
    #[default]
    Reject,
    /// A later put replaces the earlier content
    Overwrite,
}

/// How long artifacts of a finished run are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    Window(Duration),
    Forever,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Window(DEFAULT_RETENTION)
    }
}

impl RetentionPolicy {
    /// Expiry for a run finished at `finished_at`; `None` means never
    pub fn expires_at(&self, finished_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RetentionPolicy::Forever => None,
            // A window too large to represent never expires
            RetentionPolicy::Window(window) => chrono::Duration::from_std(*window)
                .ok()
                .and_then(|window| finished_at.checked_add_signed(window)),
        }
    }
}

/// Reject names that are not a single path component
pub(crate) fn check_name(name: &str) -> Result<(), ArtifactError> {
    if name.trim().is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(ArtifactError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Trait for artifact storage backends
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact for a run
    async fn put(&self, run_id: Uuid, name: &str, content: Vec<u8>) -> Result<ArtifactRef, ArtifactError>;

    /// Fetch the content of an artifact
    async fn get(&self, run_id: Uuid, name: &str) -> Result<Vec<u8>, ArtifactError>;

    /// List all artifacts of a run, ordered by name
    async fn list(&self, run_id: Uuid) -> Result<Vec<ArtifactRef>, ArtifactError>;

    /// Mark a run as finished and stamp the expiry of its artifacts
    async fn retain(&self, run_id: Uuid, policy: RetentionPolicy) -> Result<(), ArtifactError>;

    /// Remove artifacts whose retention window elapsed before `now`
    ///
    /// Returns the number of artifacts removed. Runs that were never retained
    /// are still in progress and are left alone.
    async fn collect_expired(&self, now: DateTime<Utc>) -> Result<usize, ArtifactError>;
}
