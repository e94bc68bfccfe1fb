//! Stopping the worker instance before imaging.

use async_trait::async_trait;

use super::StepServices;
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::provider::InstanceState;
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

/// Stops the worker instance so its volumes are consistent for imaging.
///
/// Reads and updates: [`keys::INSTANCE`]. No cleanup; the launch step
/// terminates the instance.
#[derive(Debug)]
pub struct StopInstanceStep {
    services: StepServices,
}

impl StopInstanceStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let instance = state.get(&keys::INSTANCE)?.clone();
        let provider = self.services.provider.as_ref();
        let region = instance.region.as_str();
        let id = instance.id.as_str();

        self.services.ui.say("Stopping the source instance...");
        self.services
            .call(cancel, move || provider.stop_instance(region, id))
            .await?;

        self.services.ui.say("Waiting for the instance to stop...");
        let stopped = self
            .services
            .waiter
            .instance_state(cancel, region, id, InstanceState::Stopped)
            .await?;

        *state.get_mut(&keys::INSTANCE)? = stopped;
        Ok(())
    }
}

#[async_trait]
impl Step for StopInstanceStep {
    fn name(&self) -> &str {
        "stop_instance"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }
}
