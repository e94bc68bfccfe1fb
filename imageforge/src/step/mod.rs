//! The step abstraction.
//!
//! A step is a forward provisioning action paired with a compensating
//! cleanup. Steps share data only through the [`StateBag`]; anything a step
//! creates and must later tear down is remembered on the step itself so
//! that cleanup works even when later steps never ran.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::warn;

use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::state::{keys, StateBag};
use crate::ui::Ui;

/// What the runner should do after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Run the next step.
    Continue,
    /// Stop forward progress. The step has recorded why under
    /// [`keys::ERROR`].
    Halt,
}

/// A unit of provisioning work with a compensating cleanup.
#[async_trait]
pub trait Step: Send + Debug {
    /// Returns the name of the step.
    ///
    /// Names are unique within a pipeline.
    fn name(&self) -> &str;

    /// Performs the forward action.
    ///
    /// On failure the step records the error with [`halt`] and returns
    /// [`StepAction::Halt`]; it should not leave half-created resources
    /// it cannot clean up later.
    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction;

    /// Undoes whatever `run` created.
    ///
    /// Called once per run for every step that started, in reverse order,
    /// whether the run completed, halted or was cancelled. Must be
    /// idempotent and must tolerate `run` never having finished. The token
    /// is fresh; it only fires if cleanup itself is being abandoned.
    async fn cleanup(
        &mut self,
        _cancel: &CancellationToken,
        _state: &mut StateBag,
    ) -> Result<(), BuildError> {
        Ok(())
    }
}

/// Records `error` as the reason the build halted and returns
/// [`StepAction::Halt`].
///
/// Replaces any previous error; the runner only ever sees the last halting
/// step's error.
pub fn halt(state: &mut StateBag, error: BuildError) -> StepAction {
    state.remove(keys::ERROR.name());
    if let Err(e) = state.put(&keys::ERROR, error) {
        warn!("Failed to record step error: {}", e);
    }
    StepAction::Halt
}

/// Maps the result of a step body onto a [`StepAction`].
///
/// Errors are tagged with the step name, shown to the operator and
/// recorded with [`halt`].
pub fn finish(
    step: &str,
    ui: &dyn Ui,
    state: &mut StateBag,
    result: Result<(), BuildError>,
) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(error) => {
            let error = BuildError::in_step(step, error);
            ui.error(&error.to_string());
            halt(state, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::CollectingUi;

    #[test]
    fn test_halt_records_error() {
        let mut state = StateBag::new();
        let action = halt(&mut state, BuildError::precondition("first"));
        assert_eq!(action, StepAction::Halt);

        halt(&mut state, BuildError::precondition("second"));
        assert_eq!(state.get(&keys::ERROR).unwrap().to_string(), "second");
    }

    #[test]
    fn test_finish_ok_continues() {
        let ui = CollectingUi::new();
        let mut state = StateBag::new();
        assert_eq!(
            finish("key_pair", &ui, &mut state, Ok(())),
            StepAction::Continue
        );
        assert!(state.is_empty());
    }

    #[test]
    fn test_finish_err_halts_with_step_name() {
        let ui = CollectingUi::new();
        let mut state = StateBag::new();

        let action = finish(
            "key_pair",
            &ui,
            &mut state,
            Err(BuildError::Internal("no keys".into())),
        );

        assert_eq!(action, StepAction::Halt);
        let err = state.get(&keys::ERROR).unwrap();
        assert!(matches!(err, BuildError::Step { step, .. } if step == "key_pair"));
        assert!(ui.contains("no keys"));
    }
}
