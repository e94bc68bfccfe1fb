//! Testing utilities for imageforge builds.
//!
//! This module provides:
//! - An in-memory provider with fault injection and eventual consistency
//! - Scripted steps that journal their runs and cleanups
//! - A collecting UI

mod provider;
mod steps;

pub use provider::{InMemoryProvider, ProviderCall, ProviderOp, Simulation};
pub use steps::{CleanupBehavior, Journal, RecordingStep, RunBehavior};

pub use crate::ui::{CollectingUi, UiLevel};
