//! Job and step domain model

use crate::core::trigger::TriggerFilter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Index of a job inside its [`PipelineGraph`](crate::core::PipelineGraph) arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub(crate) usize);

impl JobId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A job in a pipeline graph
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,

    /// Unique job name
    pub name: String,

    /// Steps, executed in order
    pub steps: Vec<Step>,

    /// Jobs this job depends on
    pub dependencies: Vec<JobId>,

    /// Artifacts consumed from upstream jobs
    pub inputs: Vec<String>,

    /// Artifacts this job must have stored when it finishes
    pub outputs: Vec<String>,

    /// Concurrency group tag
    pub concurrency_group: Option<String>,

    /// Trigger condition
    pub trigger: TriggerFilter,

    /// Whether dependents may proceed when this job fails
    pub allow_failure: bool,

    /// Retry policy
    pub retry: RetryPolicy,

    /// Timeout for one attempt; `None` uses the engine default
    pub timeout: Option<Duration>,

    /// Environment for every step of this job
    pub env: BTreeMap<String, String>,
}

impl Job {
    /// Artifacts this job produces: declared outputs plus upload steps
    pub fn produced_artifacts(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str).chain(self.steps.iter().filter_map(|s| {
            match &s.action {
                StepAction::Upload { artifact, .. } => Some(artifact.as_str()),
                _ => None,
            }
        }))
    }

    /// Artifacts this job consumes: declared inputs plus download steps
    pub fn consumed_artifacts(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str).chain(self.steps.iter().filter_map(|s| {
            match &s.action {
                StepAction::Download { artifact, .. } => Some(artifact.as_str()),
                _ => None,
            }
        }))
    }
}

/// A single step of a job
#[derive(Debug, Clone)]
pub struct Step {
    /// Display name
    pub name: String,

    /// What the step does
    pub action: StepAction,

    /// Keep going when this step fails
    pub continue_on_error: bool,

    /// Environment for this step only
    pub env: BTreeMap<String, String>,
}

/// The action performed by a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Shell command, executed through the executor
    Run { command: String },
    /// Store a workspace file as an artifact of the run
    Upload { artifact: String, path: String },
    /// Write an artifact of the run into the workspace
    Download { artifact: String, path: String },
    /// Wait for a gate verdict, optionally computing it with a command
    Gate {
        gate: String,
        timeout: Option<Duration>,
        command: Option<String>,
    },
}

impl StepAction {
    /// Short label used when a step has no explicit name
    pub fn default_name(&self) -> String {
        match self {
            StepAction::Run { command } => {
                let first_line = command.lines().next().unwrap_or("").trim();
                if first_line.chars().count() > 40 {
                    let truncated: String = first_line.chars().take(37).collect();
                    format!("{}...", truncated)
                } else {
                    first_line.to_string()
                }
            }
            StepAction::Upload { artifact, .. } => format!("upload {}", artifact),
            StepAction::Download { artifact, .. } => format!("download {}", artifact),
            StepAction::Gate { gate, .. } => format!("gate {}", gate),
        }
    }
}

impl Step {
    /// Render `{{ name }}` placeholders in a command
    pub fn render_command(command: &str, variables: &HashMap<String, String>) -> String {
        let mut rendered = command.to_string();

        for (key, value) in variables {
            let placeholder = format!("{{{{ {} }}}}", key);
            rendered = rendered.replace(&placeholder, value);
        }

        rendered
    }
}

/// Retry policy of a job: total attempts and backoff between them
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::default(),
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts ran
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Exponential backoff between attempts
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max: None,
        }
    }
}

impl Backoff {
    /// Delay before attempt `next_attempt` (2 for the first retry)
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
