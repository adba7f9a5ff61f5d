//! CLI command definitions

use crate::core::trigger::{EventType, TriggerEvent};
use crate::execution::SchedulingStrategy;
use crate::gate::ExternalCheck;
use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Scheduling strategy
    #[arg(long, value_enum, default_value_t = SchedulingStrategyArg::Parallel)]
    pub strategy: SchedulingStrategyArg,

    /// Job limit for the parallel-limited strategy
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// Trigger event type
    #[arg(long, value_enum, default_value_t = EventArg::Manual)]
    pub event: EventArg,

    /// Branch the event refers to
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// Changed path (repeatable)
    #[arg(long = "changed-path")]
    pub changed_paths: Vec<String>,

    /// Pre-seeded gate result (job=pass|fail)
    #[arg(long, value_parser = parse_gate)]
    pub gate: Vec<(String, ExternalCheck)>,

    /// Directory steps run in
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Directory for artifacts (defaults to the local data directory)
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    /// Seconds cancelled jobs get to stop before they are force-marked
    #[arg(long, default_value_t = 10)]
    pub cancel_grace_secs: u64,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

impl RunCommand {
    pub fn trigger_event(&self) -> TriggerEvent {
        TriggerEvent::new(self.event.into(), self.branch.clone()).with_changed_paths(self.changed_paths.clone())
    }

    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        match self.strategy {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::ParallelLimited => SchedulingStrategy::LimitedParallel(self.max_parallel),
        }
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines in the run history
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one run from the history
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Run ID
    pub run_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

/// Trigger event argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EventArg {
    Push,
    #[clap(name = "pull-request")]
    PullRequest,
    Manual,
}

impl From<EventArg> for EventType {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Push => EventType::Push,
            EventArg::PullRequest => EventType::PullRequest,
            EventArg::Manual => EventType::Manual,
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}

/// Parse job=pass|fail gate results
pub fn parse_gate(s: &str) -> Result<(String, ExternalCheck), String> {
    let (job, check) = parse_key_value(s)?;
    let check = check
        .parse::<ExternalCheck>()
        .map_err(|e| format!("Invalid gate result for {}: {}", job, e))?;
    Ok((job, check))
}
