//! Sequential step execution with reverse-order cleanup.

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::report::{PipelineReport, RunState, StepOutcome, StepRecord};
use super::Pipeline;
use crate::cancellation::{guarded_cleanup, CancellationToken, CleanupReport};
use crate::errors::{panic_message, BuildError};
use crate::state::{keys, StateBag};
use crate::step::{self, Step, StepAction};
use crate::ui::{TracingUi, Ui};

/// Timing budgets for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Budget for each step's cleanup.
    pub cleanup_timeout: Duration,
    /// How long a running step may keep going after cancellation.
    pub cancel_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cleanup_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    /// Sets the per-step cleanup timeout.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Sets the cancellation grace period.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Drives a [`Pipeline`] to completion, halt or cancellation, then cleans
/// up every started step in reverse order.
///
/// `run` consumes the runner, so a pipeline executes at most once.
pub struct Runner {
    pipeline: Pipeline,
    config: RunnerConfig,
    ui: Arc<dyn Ui>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("pipeline", &self.pipeline.name())
            .field("steps", &self.pipeline.step_names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Creates a runner with default budgets narrating through tracing.
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            config: RunnerConfig::default(),
            ui: Arc::new(TracingUi),
        }
    }

    /// Sets the timing budgets.
    #[must_use]
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the UI cleanup failures are reported to.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn Ui>) -> Self {
        self.ui = ui;
        self
    }

    /// Runs the pipeline.
    ///
    /// Never fails: the outcome, including the halting error and any
    /// cleanup failures, is in the returned report together with the
    /// state bag.
    pub async fn run(self, cancel: &CancellationToken, state: StateBag) -> PipelineReport {
        let span = info_span!("pipeline", pipeline = %self.pipeline.name());
        self.execute(cancel, state).instrument(span).await
    }

    async fn execute(self, cancel: &CancellationToken, mut state: StateBag) -> PipelineReport {
        let Self {
            pipeline,
            config,
            ui,
        } = self;
        let (name, mut steps) = pipeline.into_parts();
        let started_at = Utc::now();
        let mut records: Vec<StepRecord> = Vec::with_capacity(steps.len());
        let mut run_state = RunState::NotStarted;

        info!(steps = steps.len(), "Pipeline started");

        for step in &mut steps {
            if cancel.is_cancelled() {
                run_state = RunState::Cancelled;
                break;
            }
            run_state = RunState::Running;

            let step_name = step.name().to_string();
            debug!(step = %step_name, "Step started");
            let clock = Instant::now();
            let outcome = run_step(step.as_mut(), cancel, &mut state, config.cancel_grace).await;
            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            let outcome = match outcome {
                Ok(StepAction::Continue) => StepOutcome::Continued,
                Ok(StepAction::Halt) => StepOutcome::Halted,
                Err(RunInterrupted::Panicked(message)) => {
                    error!(step = %step_name, "Step panicked: {}", message);
                    let error = BuildError::StepPanicked {
                        step: step_name.clone(),
                        message,
                    };
                    ui.error(&error.to_string());
                    step::halt(&mut state, error);
                    StepOutcome::Panicked
                }
                Err(RunInterrupted::Abandoned) => {
                    warn!(
                        step = %step_name,
                        grace_ms = u64::try_from(config.cancel_grace.as_millis()).unwrap_or(u64::MAX),
                        "Step did not stop within the cancellation grace period; abandoning it"
                    );
                    StepOutcome::Abandoned
                }
            };
            debug!(step = %step_name, outcome = ?outcome, duration_ms, "Step finished");
            records.push(StepRecord {
                name: step_name,
                outcome,
                duration_ms,
            });

            run_state = match outcome {
                StepOutcome::Panicked => RunState::Halted,
                StepOutcome::Abandoned => RunState::Cancelled,
                _ if cancel.is_cancelled() => RunState::Cancelled,
                StepOutcome::Halted => RunState::Halted,
                StepOutcome::Continued => RunState::Running,
            };
            if run_state != RunState::Running {
                break;
            }
        }

        if matches!(run_state, RunState::Running | RunState::NotStarted) {
            run_state = RunState::Completed;
        }

        let cancel_reason = if run_state == RunState::Cancelled {
            let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
            state.remove(keys::CANCELLED.name());
            if let Err(e) = state.put(&keys::CANCELLED, reason.clone()) {
                warn!("Failed to record cancellation: {}", e);
            }
            ui.error(&format!("Build was cancelled: {reason}"));
            Some(reason)
        } else {
            None
        };

        let error = match run_state {
            RunState::Halted => Some(halting_error(&state, &records)),
            RunState::Cancelled => Some(BuildError::cancelled(
                cancel_reason.clone().unwrap_or_default(),
            )),
            _ => None,
        };

        match &error {
            Some(err) => warn!(state = %run_state, error = %err, "Pipeline stopped"),
            None => info!(state = %run_state, "Pipeline completed"),
        }

        let cleanup = cleanup_started(&mut steps, records.len(), &mut state, &config, ui.as_ref()).await;

        PipelineReport {
            pipeline: name,
            state: run_state,
            error,
            cancel_reason,
            steps: records,
            cleanup,
            started_at,
            ended_at: Utc::now(),
            state_bag: state,
        }
    }
}

enum RunInterrupted {
    Panicked(String),
    Abandoned,
}

/// Runs one step, racing it against cancellation.
///
/// After the token fires the step gets `grace` to return on its own; if it
/// does not, its future is dropped.
async fn run_step(
    step: &mut dyn Step,
    cancel: &CancellationToken,
    state: &mut StateBag,
    grace: Duration,
) -> Result<StepAction, RunInterrupted> {
    let running = AssertUnwindSafe(step.run(cancel, state)).catch_unwind();
    tokio::pin!(running);

    let finished = tokio::select! {
        biased;
        result = &mut running => Some(result),
        () = cancel.cancelled() => None,
    };

    let result = match finished {
        Some(result) => result,
        None => match tokio::time::timeout(grace, &mut running).await {
            Ok(result) => result,
            Err(_) => return Err(RunInterrupted::Abandoned),
        },
    };

    result.map_err(|payload| RunInterrupted::Panicked(panic_message(payload.as_ref())))
}

fn halting_error(state: &StateBag, records: &[StepRecord]) -> BuildError {
    match state.get_opt(&keys::ERROR) {
        Ok(Some(error)) => error.clone(),
        Ok(None) => {
            let step = records.last().map_or("<unknown>", |r| r.name.as_str());
            BuildError::Internal(format!("step '{step}' halted without recording an error"))
        }
        Err(e) => BuildError::State(e),
    }
}

/// Cleans up the first `started` steps in reverse order.
///
/// Uses a fresh token so that a cancelled build still tears down.
async fn cleanup_started(
    steps: &mut [Box<dyn Step>],
    started: usize,
    state: &mut StateBag,
    config: &RunnerConfig,
    ui: &dyn Ui,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let token = CancellationToken::new();

    for step in steps[..started].iter_mut().rev() {
        let step_name = step.name().to_string();
        debug!(step = %step_name, "Cleanup started");

        let outcome = guarded_cleanup(
            &step_name,
            config.cleanup_timeout,
            step.cleanup(&token, state),
        )
        .await;

        if let Err(failure) = &outcome {
            ui.error(&format!("Cleanup of {} failed: {}", failure.step, failure.message));
        }
        report.record(&step_name, outcome);
    }

    if !report.is_clean() {
        warn!(
            failures = report.failures.len(),
            "Cleanup finished with failures; some resources may need manual removal"
        );
    }
    report
}
