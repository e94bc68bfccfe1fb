//! Pipeline building and execution.
//!
//! This module provides:
//! - Pipeline builder with validation
//! - The sequential runner with its halt, cancellation and cleanup contract
//! - Run reports with per-step timings and cleanup outcomes

mod builder;
mod report;
mod runner;

pub use builder::{Pipeline, PipelineBuilder};
pub use report::{PipelineReport, RunState, StepOutcome, StepRecord};
pub use runner::{Runner, RunnerConfig};
