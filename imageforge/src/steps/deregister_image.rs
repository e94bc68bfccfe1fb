//! Replacing an existing image with the same name.

use async_trait::async_trait;
use tracing::info;

use super::StepServices;
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::state::StateBag;
use crate::step::{finish, Step, StepAction};

/// Deregisters images that already carry the target name.
///
/// Only acts when `force_deregister` is set. Checks the build region and
/// every copy region; with `force_delete_snapshot` the snapshots backing a
/// deregistered image are deleted too. Reads and publishes nothing; has
/// no cleanup since removal cannot be undone.
#[derive(Debug)]
pub struct DeregisterImageStep {
    services: StepServices,
}

impl DeregisterImageStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), BuildError> {
        let config = self.services.config.as_ref();
        if !config.force_deregister {
            return Ok(());
        }
        let provider = self.services.provider.as_ref();
        let ui = self.services.ui.as_ref();
        let name = config.image_name.as_str();

        let regions = std::iter::once(config.region.clone()).chain(config.copy_targets());
        for region in regions {
            let region = region.as_str();
            let existing = self
                .services
                .call(cancel, move || provider.find_image_by_name(region, name))
                .await?;
            let Some(image) = existing else {
                continue;
            };

            ui.say(&format!("Deregistering the existing image {} in {region}", image.id));
            let image_id = image.id.as_str();
            self.services
                .call(cancel, move || provider.deregister_image(region, image_id))
                .await?;
            info!(region, image_id, "Existing image deregistered");

            if config.force_delete_snapshot {
                for snapshot in &image.snapshot_ids {
                    let snapshot = snapshot.as_str();
                    ui.message(&format!("Deleting snapshot {snapshot}"));
                    self.services
                        .call(cancel, move || provider.delete_snapshot(region, snapshot))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step for DeregisterImageStep {
    fn name(&self) -> &str {
        "deregister_image"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }
}
