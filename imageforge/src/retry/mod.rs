//! Bounded retry with exponential backoff.
//!
//! This module provides:
//! - RetryPolicy for pure, capped delay computation
//! - Retrier for running fallible async operations under a policy
//! - RetryError describing why a retry loop stopped

mod backoff;
mod retrier;

pub use backoff::{JitterStrategy, RetryPolicy};
pub use retrier::{RetryError, RetryPredicate, Retrier};
