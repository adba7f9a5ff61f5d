//! Run context - variables and environment shared by every job of a run

use crate::core::job::{Job, Step};
use crate::core::pipeline::PipelineGraph;
use crate::core::trigger::TriggerEvent;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Per-run data handed to job runners
///
/// Built once when the run starts; workers only read it.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run being executed
    pub run_id: Uuid,

    /// Pipeline name
    pub pipeline: String,

    /// Event the run was started for
    pub event: TriggerEvent,

    /// Variables rendered into commands (pipeline variables plus overrides)
    variables: HashMap<String, String>,

    /// Pipeline-wide environment
    env: BTreeMap<String, String>,
}

impl RunContext {
    /// Create the context for a run of `graph`
    pub fn new(run_id: Uuid, graph: &PipelineGraph, event: TriggerEvent) -> Self {
        Self {
            run_id,
            pipeline: graph.name().to_string(),
            event,
            variables: graph.variables().clone(),
            env: graph.env().clone(),
        }
    }

    /// Override or add variables
    pub fn with_variables(mut self, overrides: HashMap<String, String>) -> Self {
        self.variables.extend(overrides);
        self
    }

    /// Get a variable
    pub fn variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Render `{{ name }}` placeholders of a command
    pub fn render(&self, command: &str) -> String {
        Step::render_command(command, &self.variables)
    }

    /// Environment for one step: pipeline, job and step env, then run metadata
    pub fn step_env(&self, job: &Job, step: &Step, attempt: u32) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        env.insert("RUNWAY_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("RUNWAY_PIPELINE".to_string(), self.pipeline.clone());
        env.insert("RUNWAY_JOB".to_string(), job.name.clone());
        env.insert("RUNWAY_ATTEMPT".to_string(), attempt.to_string());
        env.insert("RUNWAY_EVENT".to_string(), self.event.event_type.to_string());
        env.insert("RUNWAY_BRANCH".to_string(), self.event.branch.clone());
        env
    }
}
