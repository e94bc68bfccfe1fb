//! Observability utilities.
//!
//! This module provides:
//! - [`init_logging`] to install a `tracing-subscriber` stack (text or JSON)
//! - [`LogFormat`] for choosing the output format

mod logging;

pub use logging::{env_filter, init_logging, LogFormat, DEFAULT_FILTER};
