//! Operator-facing narration.
//!
//! Steps report progress through a [`Ui`] rather than logging directly, so
//! a front end can render build output however it likes.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Sink for human-readable build progress.
///
/// Implementations must not fail; rendering problems are swallowed.
#[cfg_attr(test, mockall::automock)]
pub trait Ui: Send + Sync {
    /// Announces a new phase of the build.
    fn say(&self, message: &str);

    /// Reports a detail within the current phase.
    fn message(&self, message: &str);

    /// Reports an error.
    fn error(&self, message: &str);
}

/// A UI that narrates through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUi;

impl Ui for TracingUi {
    fn say(&self, message: &str) {
        info!(target: "imageforge::ui", "==> {}", message);
    }

    fn message(&self, message: &str) {
        info!(target: "imageforge::ui", "    {}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "imageforge::ui", "{}", message);
    }
}

/// Severity of a collected UI line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiLevel {
    /// From [`Ui::say`].
    Say,
    /// From [`Ui::message`].
    Message,
    /// From [`Ui::error`].
    Error,
}

/// A collecting UI for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingUi {
    lines: parking_lot::RwLock<Vec<(UiLevel, String)>>,
}

impl CollectingUi {
    /// Creates a new collecting UI.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected lines.
    #[must_use]
    pub fn lines(&self) -> Vec<(UiLevel, String)> {
        self.lines.read().clone()
    }

    /// Returns the collected lines of one level.
    #[must_use]
    pub fn lines_at(&self, level: UiLevel) -> Vec<String> {
        self.lines
            .read()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Returns true if any line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.read().iter().any(|(_, line)| line.contains(needle))
    }

    /// Clears all collected lines.
    pub fn clear(&self) {
        self.lines.write().clear();
    }

    fn push(&self, level: UiLevel, message: &str) {
        self.lines.write().push((level, message.to_string()));
    }
}

impl Ui for CollectingUi {
    fn say(&self, message: &str) {
        self.push(UiLevel::Say, message);
    }

    fn message(&self, message: &str) {
        self.push(UiLevel::Message, message);
    }

    fn error(&self, message: &str) {
        self.push(UiLevel::Error, message);
    }
}
