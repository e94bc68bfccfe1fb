//! Scripted steps for exercising the runner.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::state::StateBag;
use crate::step::{halt, Step, StepAction};

/// A shared, ordered log of step activity.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Returns every entry in order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Returns the entries that start with `prefix`, prefix stripped.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(String::from))
            .collect()
    }
}

/// What a [`RecordingStep`] does when run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBehavior {
    /// Return `Continue`.
    Continue,
    /// Record an error and return `Halt`.
    Halt,
    /// Panic.
    Panic,
    /// Wait for cancellation, then halt with the cancellation error.
    BlockUntilCancelled,
    /// Sleep for the given time regardless of cancellation, then continue.
    IgnoreCancellation(Duration),
}

/// What a [`RecordingStep`] does when cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupBehavior {
    /// Succeed.
    Succeed,
    /// Return an error.
    Fail,
    /// Panic.
    Panic,
    /// Never finish.
    Hang,
}

/// A step that records `run:<name>` and `cleanup:<name>` into a [`Journal`].
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    journal: Journal,
    run: RunBehavior,
    cleanup: CleanupBehavior,
}

impl RecordingStep {
    /// Creates a step that continues and cleans up successfully.
    #[must_use]
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            run: RunBehavior::Continue,
            cleanup: CleanupBehavior::Succeed,
        }
    }

    /// Sets the run behaviour.
    #[must_use]
    pub fn with_run(mut self, behavior: RunBehavior) -> Self {
        self.run = behavior;
        self
    }

    /// Sets the cleanup behaviour.
    #[must_use]
    pub fn with_cleanup(mut self, behavior: CleanupBehavior) -> Self {
        self.cleanup = behavior;
        self
    }

    /// Boxes the step for a pipeline.
    #[must_use]
    pub fn boxed(self) -> Box<dyn Step> {
        Box::new(self)
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        self.journal.push(format!("run:{}", self.name));
        match self.run {
            RunBehavior::Continue => StepAction::Continue,
            RunBehavior::Halt => halt(
                state,
                BuildError::in_step(&self.name, BuildError::Internal(format!("{} failed", self.name))),
            ),
            RunBehavior::Panic => panic!("{} panicked", self.name),
            RunBehavior::BlockUntilCancelled => {
                cancel.cancelled().await;
                let reason = cancel.reason().unwrap_or_default();
                halt(state, BuildError::cancelled(reason))
            }
            RunBehavior::IgnoreCancellation(duration) => {
                tokio::time::sleep(duration).await;
                self.journal.push(format!("finished:{}", self.name));
                StepAction::Continue
            }
        }
    }

    async fn cleanup(
        &mut self,
        cancel: &CancellationToken,
        _state: &mut StateBag,
    ) -> Result<(), BuildError> {
        self.journal.push(format!("cleanup:{}", self.name));
        if cancel.is_cancelled() {
            self.journal.push(format!("cleanup-token-cancelled:{}", self.name));
        }
        match self.cleanup {
            CleanupBehavior::Succeed => Ok(()),
            CleanupBehavior::Fail => Err(BuildError::Internal(format!(
                "{} cleanup failed",
                self.name
            ))),
            CleanupBehavior::Panic => panic!("{} cleanup panicked", self.name),
            CleanupBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
