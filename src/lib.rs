//! runway - a CI/CD pipeline orchestration engine
//!
//! Pipelines are YAML documents describing a graph of jobs. The engine runs
//! jobs as soon as their dependencies allow, passes artifacts between them,
//! holds jobs on quality gates and records every run in an event ledger.

pub mod artifact;
pub mod cli;
pub mod core;
pub mod execution;
pub mod executor;
pub mod gate;
pub mod ledger;
pub mod logging;
pub mod persistence;

// Re-export commonly used types
pub use artifact::{ArtifactRef, ArtifactStore, FsArtifactStore, InMemoryArtifactStore, RetentionPolicy};
pub use core::{
    DefinitionError, JobState, PipelineConfig, PipelineGraph, RunStatus, TriggerEvent,
};
pub use execution::{EngineConfig, EngineError, ExecutionEngine, RunHandle, SchedulingStrategy};
pub use executor::{ShellExecutor, StepExecutor};
pub use gate::{ExternalCheck, GateEvaluator, GateResult};
pub use ledger::{EventKind, RunEvent, RunLedger, RunSnapshot};
