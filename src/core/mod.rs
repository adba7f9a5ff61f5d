//! Core domain models for runway
//!
//! This module defines the pipeline definition format, the validated job
//! graph built from it, and the state types shared by the scheduler, the
//! ledger and the CLI.

pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod state;
pub mod trigger;

pub use config::PipelineConfig;
pub use context::*;
pub use error::DefinitionError;
pub use job::*;
pub use pipeline::*;
pub use state::*;
pub use trigger::*;
