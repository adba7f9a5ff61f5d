//! Pipeline execution

pub mod engine;
mod runner;
pub mod scheduler;

pub use engine::{EngineConfig, EngineError, ExecutionEngine, RunCanceller, RunHandle};
pub use scheduler::{Dispatch, Retry, Scheduler, SchedulerStep, SchedulingStrategy, Transition};
