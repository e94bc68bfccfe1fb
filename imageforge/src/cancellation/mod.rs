//! Cooperative cancellation and guarded cleanup.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - Interruptible sleeps and guarded futures
//! - Cleanup execution with timeouts and panic capture

mod cleanup;
mod token;

pub use cleanup::{guarded_cleanup, CleanupFailure, CleanupFailureKind, CleanupReport};
pub use token::{CancellationToken, Cancelled};
