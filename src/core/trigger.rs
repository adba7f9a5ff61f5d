//! Trigger events and per-job trigger filters

use crate::core::config::TriggerConfig;
use crate::core::error::DefinitionError;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of event that started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    PullRequest,
    Manual,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Push => "push",
            EventType::PullRequest => "pull_request",
            EventType::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "push" => Ok(EventType::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventType::PullRequest),
            "manual" | "workflow_dispatch" => Ok(EventType::Manual),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// The event a run is instantiated against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_type: EventType,
    pub branch: String,
    #[serde(default)]
    pub changed_paths: Vec<String>,
}

impl TriggerEvent {
    pub fn new(event_type: EventType, branch: impl Into<String>) -> Self {
        Self {
            event_type,
            branch: branch.into(),
            changed_paths: Vec::new(),
        }
    }

    pub fn push(branch: impl Into<String>) -> Self {
        Self::new(EventType::Push, branch)
    }

    pub fn pull_request(branch: impl Into<String>) -> Self {
        Self::new(EventType::PullRequest, branch)
    }

    pub fn manual(branch: impl Into<String>) -> Self {
        Self::new(EventType::Manual, branch)
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

/// A compiled set of glob patterns
#[derive(Debug, Clone)]
struct PatternSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl PatternSet {
    fn compile(job: &str, field: &str, patterns: &[String]) -> Result<Option<Self>, DefinitionError> {
        if patterns.is_empty() {
            return Ok(None);
        }

        let mut builder = GlobSetBuilder::new();
        for (i, pattern) in patterns.iter().enumerate() {
            let invalid = |message: String| DefinitionError::InvalidTriggerPattern {
                job: job.to_string(),
                field: format!("{}[{}]", field, i),
                pattern: pattern.clone(),
                message,
            };

            if pattern.trim().is_empty() {
                return Err(invalid("pattern is empty".to_string()));
            }

            // `*` stays within one path segment, `**` crosses segments
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| invalid(e.kind().to_string()))?;
            builder.add(glob);
        }

        let set = builder.build().map_err(|e| DefinitionError::InvalidTriggerPattern {
            job: job.to_string(),
            field: field.to_string(),
            pattern: patterns.join(", "),
            message: e.to_string(),
        })?;

        Ok(Some(Self {
            patterns: patterns.to_vec(),
            set,
        }))
    }

    fn is_match(&self, candidate: &str) -> bool {
        self.set.is_match(candidate)
    }
}

/// Trigger condition of a job, compiled at parse time
///
/// An empty filter matches every event.
#[derive(Debug, Clone, Default)]
pub struct TriggerFilter {
    events: Vec<EventType>,
    branches: Option<PatternSet>,
    paths: Option<PatternSet>,
    paths_ignore: Option<PatternSet>,
}

impl TriggerFilter {
    /// Compile a filter from its configuration, reporting the first malformed pattern
    pub fn compile(job: &str, config: &TriggerConfig) -> Result<Self, DefinitionError> {
        Ok(Self {
            events: config.events.clone(),
            branches: PatternSet::compile(job, "trigger.branches", &config.branches)?,
            paths: PatternSet::compile(job, "trigger.paths", &config.paths)?,
            paths_ignore: PatternSet::compile(job, "trigger.pathsIgnore", &config.paths_ignore)?,
        })
    }

    /// Whether the filter accepts every event
    pub fn is_unconditional(&self) -> bool {
        self.events.is_empty()
            && self.branches.is_none()
            && self.paths.is_none()
            && self.paths_ignore.is_none()
    }

    /// Branch patterns as written in the definition
    pub fn branch_patterns(&self) -> &[String] {
        self.branches.as_ref().map(|p| p.patterns.as_slice()).unwrap_or(&[])
    }

    /// Evaluate the filter against an event
    ///
    /// Manual events and events without changed paths bypass the path filters.
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        if !self.events.is_empty() && !self.events.contains(&event.event_type) {
            return false;
        }

        if let Some(branches) = &self.branches {
            if !branches.is_match(&event.branch) {
                return false;
            }
        }

        if event.event_type == EventType::Manual || event.changed_paths.is_empty() {
            return true;
        }

        if let Some(ignore) = &self.paths_ignore {
            if event.changed_paths.iter().all(|p| ignore.is_match(p)) {
                return false;
            }
        }

        if let Some(paths) = &self.paths {
            if !event.changed_paths.iter().any(|p| paths.is_match(p)) {
                return false;
            }
        }

        true
    }
}
