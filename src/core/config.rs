//! Pipeline configuration from YAML

use crate::core::error::DefinitionError;
use crate::core::pipeline::PipelineGraph;
use crate::core::trigger::EventType;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Variables rendered into step commands as `{{ name }}`
    #[serde(default)]
    variables: HashMap<String, Value>,

    /// Environment shared by every step
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Pipeline-wide defaults for jobs and gates
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Global and per-group concurrency limits
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Jobs, either as a mapping of name to job or as a list of named jobs
    #[serde(deserialize_with = "deserialize_jobs")]
    pub jobs: Vec<JobConfig>,
}

/// Defaults applied to jobs that do not set their own values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsConfig {
    /// Default job timeout (in seconds)
    #[serde(default, alias = "timeout_secs")]
    pub timeout_secs: Option<u64>,

    /// Default time a gate may stay pending (in seconds)
    #[serde(default, alias = "gate_timeout_secs")]
    pub gate_timeout_secs: Option<u64>,
}

/// Concurrency limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// Maximum number of jobs running at once across the pipeline
    #[serde(default, alias = "max_parallel")]
    pub max_parallel: Option<usize>,

    /// Per-group limits; groups not listed here are unlimited
    #[serde(default)]
    pub groups: BTreeMap<String, usize>,
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Unique job name (taken from the mapping key in mapping form)
    #[serde(default)]
    pub name: String,

    /// Names of jobs this job depends on
    #[serde(default, alias = "depends_on", alias = "needs")]
    pub depends_on: Vec<String>,

    /// Ordered steps
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Trigger condition; absent means the job runs for every event
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,

    /// Concurrency group tag
    #[serde(default, alias = "concurrency_group")]
    pub concurrency_group: Option<String>,

    /// Whether dependents may proceed when this job fails
    #[serde(default, alias = "allow_failure")]
    pub allow_failure: bool,

    /// Retry policy for failed attempts
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Timeout for one attempt of this job (overrides the pipeline default)
    #[serde(default, alias = "timeout_secs")]
    pub timeout_secs: Option<u64>,

    /// Declared artifact inputs and outputs
    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// Environment for every step of this job
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Step configuration as defined in YAML
///
/// Exactly one of `run`, `upload`, `download` or `gate` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Shell command
    #[serde(default)]
    pub run: Option<String>,

    /// Store a workspace file as an artifact
    #[serde(default)]
    pub upload: Option<ArtifactTransferConfig>,

    /// Fetch an artifact into the workspace
    #[serde(default)]
    pub download: Option<ArtifactTransferConfig>,

    /// Wait for a quality gate verdict
    #[serde(default)]
    pub gate: Option<GateStepConfig>,

    /// Keep going when this step fails
    #[serde(default, alias = "continue_on_error")]
    pub continue_on_error: bool,

    /// Environment for this step only
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Artifact upload/download parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactTransferConfig {
    /// Artifact name, unique within a run
    #[serde(alias = "name")]
    pub artifact: String,

    /// Workspace-relative file path
    pub path: String,
}

/// Gate step parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStepConfig {
    /// Gate name, used in diagnostics
    pub name: String,

    /// How long the gate may stay pending (in seconds)
    #[serde(default, alias = "timeout_secs")]
    pub timeout_secs: Option<u64>,

    /// Optional command whose exit code decides the gate
    #[serde(default)]
    pub run: Option<String>,
}

/// Trigger condition configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    /// Branch globs the event branch must match
    #[serde(default)]
    pub branches: Vec<String>,

    /// Path globs; at least one changed path must match
    #[serde(default)]
    pub paths: Vec<String>,

    /// Path globs; the job is skipped when every changed path matches
    #[serde(default, alias = "paths_ignore", alias = "paths-ignore")]
    pub paths_ignore: Vec<String>,

    /// Event types the job reacts to
    #[serde(default)]
    pub events: Vec<EventType>,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub attempts: u32,

    /// Delay between attempts
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay before the second attempt (in seconds)
    #[serde(default = "default_backoff_initial", alias = "initial_secs")]
    pub initial_secs: f64,

    /// Multiplier applied for every further attempt
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,

    /// Upper bound for a single delay (in seconds)
    #[serde(default, alias = "max_secs")]
    pub max_secs: Option<f64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_backoff_initial(),
            factor: default_backoff_factor(),
            max_secs: None,
        }
    }
}

fn default_backoff_initial() -> f64 {
    1.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

/// Declared artifacts of a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Artifacts this job consumes from upstream jobs
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Artifacts this job must produce
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Accept `jobs` either as a list of named jobs or as a mapping name -> job.
///
/// Repeated names are kept so that validation can report them.
fn deserialize_jobs<'de, D>(deserializer: D) -> Result<Vec<JobConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct JobsVisitor;

    impl<'de> Visitor<'de> for JobsVisitor {
        type Value = Vec<JobConfig>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a list of jobs or a mapping of job name to job")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut jobs = Vec::new();
            while let Some(job) = seq.next_element::<JobConfig>()? {
                jobs.push(job);
            }
            Ok(jobs)
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut jobs = Vec::new();
            while let Some((name, job)) = map.next_entry::<String, Option<JobConfig>>()? {
                let mut job = job.unwrap_or_default();
                if !job.name.is_empty() && job.name != name {
                    return Err(de::Error::custom(format!(
                        "job '{}' declares a different name '{}'",
                        name, job.name
                    )));
                }
                job.name = name;
                jobs.push(job);
            }
            Ok(jobs)
        }
    }

    deserializer.deserialize_any(JobsVisitor)
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    ///
    /// Validation is exactly the graph construction; nothing that fails here
    /// can ever be scheduled.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        PipelineGraph::from_config(self).map(|_| ())
    }

    /// Get variables as string map
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Null => String::new(),
                    other => serde_yaml::to_string(other)
                        .map(|s| s.trim_end().to_string())
                        .unwrap_or_default(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    /// Convert config to the validated job graph
    pub fn to_graph(&self) -> Result<PipelineGraph, DefinitionError> {
        PipelineGraph::from_config(self)
    }
}
