//! Pipeline definition errors
//!
//! Every variant produced by validation names the offending job and the
//! field path inside that job, so a diagnostic can point at the exact spot
//! in the YAML document.

use thiserror::Error;

/// Errors raised while loading or validating a pipeline definition.
///
/// These never reach the scheduler: a definition that fails validation is
/// never turned into a run.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read pipeline definition: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse pipeline definition: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("pipeline defines no jobs")]
    Empty,

    #[error("job at {field} has no name")]
    MissingJobName { field: String },

    #[error("job '{job}' is defined more than once ({field})")]
    DuplicateJobName { job: String, field: String },

    #[error("job '{job}' depends on unknown job '{dependency}' ({field})")]
    UnknownDependency {
        job: String,
        field: String,
        dependency: String,
    },

    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    CyclicGraph { cycle: Vec<String> },

    #[error("job '{job}' has invalid pattern '{pattern}' in {field}: {message}")]
    InvalidTriggerPattern {
        job: String,
        field: String,
        pattern: String,
        message: String,
    },

    #[error("job '{job}' uses invalid concurrency group '{group}' ({field})")]
    InvalidConcurrencyGroup {
        job: String,
        field: String,
        group: String,
    },

    #[error("job '{job}' has an invalid step at {field}: {message}")]
    InvalidStep {
        job: String,
        field: String,
        message: String,
    },

    #[error("job '{job}' uses invalid artifact name '{name}' ({field})")]
    InvalidArtifactName {
        job: String,
        field: String,
        name: String,
    },

    #[error("job '{job}' consumes artifact '{artifact}' that no upstream job produces ({field})")]
    UnresolvedArtifact {
        job: String,
        field: String,
        artifact: String,
    },

    #[error("job '{job}' has an invalid retry policy ({field}): {message}")]
    InvalidRetry {
        job: String,
        field: String,
        message: String,
    },
}

impl DefinitionError {
    /// Job the error is attributed to, if any.
    pub fn job(&self) -> Option<&str> {
        match self {
            DefinitionError::DuplicateJobName { job, .. }
            | DefinitionError::UnknownDependency { job, .. }
            | DefinitionError::InvalidTriggerPattern { job, .. }
            | DefinitionError::InvalidConcurrencyGroup { job, .. }
            | DefinitionError::InvalidStep { job, .. }
            | DefinitionError::InvalidArtifactName { job, .. }
            | DefinitionError::UnresolvedArtifact { job, .. }
            | DefinitionError::InvalidRetry { job, .. } => Some(job),
            DefinitionError::CyclicGraph { cycle } => cycle.first().map(String::as_str),
            DefinitionError::Io(_)
            | DefinitionError::Yaml(_)
            | DefinitionError::Empty
            | DefinitionError::MissingJobName { .. } => None,
        }
    }

    /// Field path inside the job, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            DefinitionError::DuplicateJobName { field, .. }
            | DefinitionError::UnknownDependency { field, .. }
            | DefinitionError::InvalidTriggerPattern { field, .. }
            | DefinitionError::InvalidConcurrencyGroup { field, .. }
            | DefinitionError::InvalidStep { field, .. }
            | DefinitionError::InvalidArtifactName { field, .. }
            | DefinitionError::UnresolvedArtifact { field, .. }
            | DefinitionError::InvalidRetry { field, .. } => Some(field),
            DefinitionError::MissingJobName { field } => Some(field),
            DefinitionError::CyclicGraph { .. } => Some("dependsOn"),
            _ => None,
        }
    }
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::from("<empty>"),
    }
}
