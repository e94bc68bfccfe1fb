//! Imaging the stopped worker instance.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{may_have_created, orphaned_image, remove_image, snapshots_of, StepServices};
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

#[derive(Debug, Clone)]
struct CreatedImage {
    region: String,
    image_id: String,
    snapshot_ids: Vec<String>,
}

impl CreatedImage {
    fn new(region: &str, image_id: String) -> Self {
        Self {
            region: region.to_string(),
            image_id,
            snapshot_ids: Vec::new(),
        }
    }
}

/// Creates the image and waits until it is available.
///
/// Reads: [`keys::INSTANCE`]. Publishes: [`keys::IMAGES`] and
/// [`keys::SNAPSHOTS`] for the build region.
///
/// The image is the build's artifact, so cleanup only removes it (and its
/// snapshots) when the build halted or was cancelled.
#[derive(Debug)]
pub struct CreateImageStep {
    services: StepServices,
    created: Option<CreatedImage>,
}

impl CreateImageStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self {
            services,
            created: None,
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let instance = state.get(&keys::INSTANCE)?.clone();
        let provider = self.services.provider.as_ref();
        let ui = self.services.ui.as_ref();
        let name = self.services.config.image_name.as_str();
        let region = instance.region.as_str();

        ui.say(&format!("Creating image: {name}"));
        let created = {
            let instance_id = instance.id.as_str();
            self.services
                .create(cancel, move || provider.create_image(region, instance_id, name))
                .await
        };
        let image_id = match created {
            Ok(image_id) => image_id,
            Err(error) => {
                if may_have_created(&error) {
                    if let Some(image_id) = orphaned_image(provider, region, name).await {
                        warn!(region, image_id = %image_id, "Image exists despite failed create");
                        self.created = Some(CreatedImage::new(region, image_id));
                    }
                }
                return Err(error);
            }
        };
        ui.message(&format!("Image: {image_id}"));
        self.created = Some(CreatedImage::new(region, image_id.clone()));

        ui.say("Waiting for the image to become ready...");
        let image = self
            .services
            .waiter
            .image_available(cancel, region, &image_id)
            .await?;
        if let Some(created) = self.created.as_mut() {
            created.snapshot_ids.clone_from(&image.snapshot_ids);
        }

        info!(region, image_id = %image.id, snapshots = image.snapshot_ids.len(), "Image available");
        state.put(
            &keys::IMAGES,
            BTreeMap::from([(region.to_string(), image.id.clone())]),
        )?;
        state.put(
            &keys::SNAPSHOTS,
            BTreeMap::from([(region.to_string(), image.snapshot_ids)]),
        )?;
        Ok(())
    }
}

#[async_trait]
impl Step for CreateImageStep {
    fn name(&self) -> &str {
        "create_image"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }

    async fn cleanup(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        if !keys::build_failed(state) {
            return Ok(());
        }
        let Some(mut created) = self.created.clone() else {
            return Ok(());
        };
        let provider = self.services.provider.as_ref();

        // The wait may have failed before the snapshots were known.
        if created.snapshot_ids.is_empty() {
            created.snapshot_ids = snapshots_of(provider, &created.region, &created.image_id).await;
        }

        self.services
            .ui
            .say("Deregistering the image and deleting its snapshots because of cancellation or error...");
        remove_image(
            provider,
            &self.services.teardown_retrier(),
            cancel,
            &created.region,
            &created.image_id,
            &created.snapshot_ids,
        )
        .await?;

        if let Ok(images) = state.get_mut(&keys::IMAGES) {
            images.remove(&created.region);
        }
        if let Ok(snapshots) = state.get_mut(&keys::SNAPSHOTS) {
            snapshots.remove(&created.region);
        }

        self.created = None;
        Ok(())
    }
}
