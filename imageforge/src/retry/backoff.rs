//! Retry policy and backoff delay computation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::ConfigError;

/// Jitter strategy to spread out concurrent retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Each delay lands between the previous un-jittered delay and its own
    Equal,
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Bounded exponential backoff.
///
/// `delay(n)` for the 1-indexed attempt `n` is
/// `min(max_delay, initial_delay * multiplier^(n-1))`; the sequence is
/// non-decreasing and never exceeds `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay cap, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the un-jittered delay after failed attempt `attempt` (1-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_delay_ms as f64;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = if scaled.is_finite() && scaled < cap {
            scaled as u64
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Returns the delay with the configured jitter applied.
    ///
    /// Equal jitter draws attempt `n`'s delay from `[delay(n-1), delay(n)]`
    /// with `delay(0) = delay(1) / 2`, so a jittered sequence is still
    /// non-decreasing and never longer than [`RetryPolicy::delay`].
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Equal => {
                let floor = if attempt <= 1 {
                    delay / 2
                } else {
                    self.delay(attempt - 1)
                };
                let low = u64::try_from(floor.as_millis()).unwrap_or(u64::MAX);
                let high = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                if low >= high {
                    delay
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
                }
            }
        }
    }

    /// Iterates over the un-jittered delays `Delay(1)..Delay(max_attempts - 1)`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay(attempt))
    }

    /// Returns the sum of all un-jittered delays.
    #[must_use]
    pub fn total_delay(&self) -> Duration {
        self.delays().sum()
    }

    /// Checks the policy for impossible settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.multiplier",
                format!("must be a finite number >= 1, got {}", self.multiplier),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.initial_delay_ms",
                format!(
                    "initial delay {}ms exceeds max delay {}ms",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("max_attempts".to_string(), serde_json::json!(self.max_attempts));
        map.insert(
            "initial_delay_ms".to_string(),
            serde_json::json!(self.initial_delay_ms),
        );
        map.insert("max_delay_ms".to_string(), serde_json::json!(self.max_delay_ms));
        map.insert("multiplier".to_string(), serde_json::json!(self.multiplier));
        map.insert("jitter".to_string(), serde_json::json!(self.jitter));
        map
    }
}
