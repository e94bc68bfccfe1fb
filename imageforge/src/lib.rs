//! # Imageforge
//!
//! A build orchestration engine for machine images.
//!
//! An image build is an ordered pipeline of provisioning steps run against a
//! cloud compute provider, with support for:
//!
//! - **Guaranteed cleanup**: every step that started is cleaned up in reverse
//!   order, whether the build completed, halted, panicked or was cancelled
//! - **Retries**: provider calls are retried with exponential backoff, driven
//!   by a typed error classification
//! - **Waiting**: resources are polled into their target states with bounded
//!   attempts
//! - **Region replication**: the finished image is copied to every region
//!   concurrently, and partial successes are kept and reported
//! - **Cancellation**: cooperative, with a grace period before a step is
//!   abandoned
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use imageforge::prelude::*;
//!
//! let config = BuildConfig::from_path("build.json")?;
//! let build = ImageBuild::new(config, provider)?;
//!
//! let artifact = build.run(&CancellationToken::new()).await?;
//! println!("{artifact}");
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifact;
pub mod build;
pub mod cancellation;
pub mod config;
pub mod errors;
pub mod identity;
pub mod observability;
pub mod pipeline;
pub mod provider;
pub mod replication;
pub mod retry;
pub mod state;
pub mod step;
pub mod steps;
pub mod testing;
pub mod ui;
pub mod waiter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifact::Artifact;
    pub use crate::build::ImageBuild;
    pub use crate::cancellation::{CancellationToken, CleanupReport};
    pub use crate::config::BuildConfig;
    pub use crate::errors::{BuildError, Classify, ConfigError, ErrorClass};
    pub use crate::identity::BuildIdentity;
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{PipelineBuilder, PipelineReport, RunState, Runner, RunnerConfig};
    pub use crate::provider::{ImageProvider, ProviderError, ProviderResult};
    pub use crate::replication::{ReplicationConfig, Replicator};
    pub use crate::retry::{Retrier, RetryPolicy};
    pub use crate::state::{keys, StateBag, StateKey};
    pub use crate::step::{Step, StepAction};
    pub use crate::ui::{TracingUi, Ui};
    pub use crate::waiter::{ResourceWaiter, WaitConfig};
}
