//! Shared per-run state.
//!
//! This module provides:
//! - The type-erased [`StateBag`] threaded through a pipeline run
//! - Typed [`StateKey`] accessors
//! - The well-known keys steps publish for each other

mod bag;
pub mod keys;

pub use bag::{StateBag, StateKey};
