//! Subscriber installation.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::errors::{BuildError, ConfigError};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::invalid(
                "log_format",
                format!("unknown format '{other}', expected 'text' or 'json'"),
            )),
        }
    }
}

/// Builds the filter: `RUST_LOG` if set, `default_filter` otherwise.
///
/// # Errors
///
/// Returns `ConfigError::Invalid` if `default_filter` is not a valid
/// directive.
pub fn env_filter(default_filter: &str) -> Result<EnvFilter, ConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| ConfigError::invalid("log_filter", e.to_string())),
    }
}

/// Installs the global tracing subscriber.
///
/// Call once, early in `main`. A second call fails rather than replacing
/// the installed subscriber.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber is
/// already installed.
pub fn init_logging(format: LogFormat, default_filter: &str) -> Result<(), BuildError> {
    let filter = env_filter(default_filter)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    installed.map_err(|e| BuildError::Internal(format!("failed to install subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_invalid_default_filter() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter("imageforge=loudest").is_err());
            assert!(env_filter("imageforge=debug").is_ok());
        }
    }

    #[test]
    fn test_second_install_fails() {
        let _ = init_logging(LogFormat::Text, DEFAULT_FILTER);
        assert!(init_logging(LogFormat::Json, DEFAULT_FILTER).is_err());
    }
}
