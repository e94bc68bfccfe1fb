//! Source image lookup.

use async_trait::async_trait;
use tracing::info;

use super::StepServices;
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::provider::ImageState;
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

/// Resolves the source image and checks the target name is free.
///
/// Reads: nothing. Publishes: [`keys::SOURCE_IMAGE`].
///
/// Unless `force_deregister` is set, an existing image with the target name
/// in the build region or any copy region fails the build here, before
/// anything is created.
#[derive(Debug)]
pub struct SourceImageStep {
    services: StepServices,
}

impl SourceImageStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let config = self.services.config.as_ref();
        let provider = self.services.provider.as_ref();
        let ui = self.services.ui.as_ref();
        let region = config.region.as_str();
        let source = config.source_image.as_str();

        ui.say(&format!("Inspecting the source image {source}..."));
        let image = self
            .services
            .call(cancel, move || provider.describe_image(region, source))
            .await?;
        if image.state != ImageState::Available {
            return Err(BuildError::precondition(format!(
                "source image {source} is {}, expected available",
                image.state
            )));
        }
        ui.message(&format!("Found image {} ({})", image.id, image.name));

        if !config.force_deregister {
            let name = config.image_name.as_str();
            let regions = std::iter::once(config.region.clone()).chain(config.copy_targets());
            for target in regions {
                let target = target.as_str();
                let existing = self
                    .services
                    .call(cancel, move || provider.find_image_by_name(target, name))
                    .await?;
                if let Some(existing) = existing {
                    return Err(BuildError::precondition(format!(
                        "an image named '{name}' already exists in {target} ({}); \
                         set force_deregister to replace it",
                        existing.id
                    )));
                }
            }
        }

        info!(region, image_id = %image.id, "Source image resolved");
        state.put(&keys::SOURCE_IMAGE, image)?;
        Ok(())
    }
}

#[async_trait]
impl Step for SourceImageStep {
    fn name(&self) -> &str {
        "source_image"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }
}
