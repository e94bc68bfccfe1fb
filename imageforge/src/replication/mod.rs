//! Fan-out/fan-in across independent targets.
//!
//! This module provides:
//! - ReplicationTask describing one target's work
//! - Replicator running every task on its own tokio task and joining them
//! - ReplicationResult and ReplicationError with per-target outcomes

mod replicator;
mod result;

pub use replicator::{ReplicationConfig, ReplicationTask, Replicator};
pub use result::{ReplicationError, ReplicationResult, TargetFailure};
