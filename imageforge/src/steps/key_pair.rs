//! SSH key pair for the worker instance.

use async_trait::async_trait;
use tracing::info;

use super::{deleted, StepServices};
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::provider::KeyPair;
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

/// Provides the key pair the worker instance is launched with.
///
/// Reads: [`keys::BUILD`]. Publishes: [`keys::KEY_PAIR`].
///
/// Uses `key_pair_name` from the configuration when set; otherwise creates
/// a temporary pair named after the build, which cleanup deletes. Cleanup
/// runs even when the create call failed, since the provider may have
/// created the pair before the failure.
#[derive(Debug)]
pub struct KeyPairStep {
    services: StepServices,
    created: Option<String>,
}

impl KeyPairStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self {
            services,
            created: None,
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let ui = self.services.ui.as_ref();

        if let Some(name) = &self.services.config.key_pair_name {
            ui.say(&format!("Using existing key pair {name}"));
            state.put(
                &keys::KEY_PAIR,
                KeyPair {
                    name: name.clone(),
                    private_key: None,
                    temporary: false,
                },
            )?;
            return Ok(());
        }

        let name = state.get(&keys::BUILD)?.temporary_name("key_pair");
        let provider = self.services.provider.as_ref();
        let region = self.services.config.region.as_str();

        ui.say(&format!("Creating temporary key pair: {name}"));
        // Recorded up front: a failed call may still have created the pair.
        self.created = Some(name.clone());
        let pair = {
            let name = name.as_str();
            self.services
                .create(cancel, move || provider.create_key_pair(region, name))
                .await?
        };
        info!(region, key_pair = %name, "Temporary key pair created");

        state.put(&keys::KEY_PAIR, pair)?;
        Ok(())
    }
}

#[async_trait]
impl Step for KeyPairStep {
    fn name(&self) -> &str {
        "key_pair"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }

    async fn cleanup(&mut self, cancel: &CancellationToken, _state: &mut StateBag) -> Result<(), BuildError> {
        let Some(name) = self.created.clone() else {
            return Ok(());
        };
        let provider = self.services.provider.as_ref();
        let region = self.services.config.region.as_str();

        self.services.ui.say("Deleting temporary key pair...");
        let key_name = name.as_str();
        let outcome = self
            .services
            .teardown_retrier()
            .run(cancel, move || provider.delete_key_pair(region, key_name))
            .await;
        deleted(&name, outcome)?;

        self.created = None;
        Ok(())
    }
}
