//! Copying the finished image to other regions.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    may_have_created, orphaned_image, remove_image, snapshots_of, teardown_retrier, StepServices,
};
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::replication::ReplicationTask;
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

/// An image copy in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedImage {
    /// The copy's image id.
    pub image_id: String,
    /// Snapshots backing the copy; empty until the copy is available.
    pub snapshot_ids: Vec<String>,
}

/// Copies still registered, by region.
type CopyLedger = Arc<Mutex<BTreeMap<String, CopiedImage>>>;

/// Replicates the image to every copy region concurrently.
///
/// Reads: [`keys::IMAGES`] (the build region's image). Updates:
/// [`keys::IMAGES`] and [`keys::SNAPSHOTS`] with every successful copy.
///
/// Each region is an independent replication target that copies, then
/// waits for availability; a copy that never becomes available is removed
/// by its own worker. A failed copy request is followed by a lookup by
/// name, and a copy registered anyway is left for cleanup. Successful
/// copies are published even when other regions fail, and the step then
/// halts with every per-region cause.
/// Cleanup removes all copies when the build did not complete.
#[derive(Debug)]
pub struct RegionCopyStep {
    services: StepServices,
    copies: CopyLedger,
}

impl RegionCopyStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self {
            services,
            copies: Arc::default(),
        }
    }

    fn copy_task(&self, source_image: &str, target: &str) -> ReplicationTask<CopiedImage> {
        let provider = Arc::clone(&self.services.provider);
        let creator = self.services.creator.clone();
        let retrier = self.services.retrier.clone();
        let waiter = self.services.waiter.clone();
        let ledger = Arc::clone(&self.copies);
        let source_region = self.services.config.region.clone();
        let name = self.services.config.image_name.clone();
        let source_image = source_image.to_string();
        let target = target.to_string();

        ReplicationTask::new(target.clone(), move |cancel| async move {
            let provider = provider.as_ref();
            let image_id = {
                let (from, image, to, name) = (
                    source_region.as_str(),
                    source_image.as_str(),
                    target.as_str(),
                    name.as_str(),
                );
                let copied = creator
                    .run(&cancel, move || provider.copy_image(from, image, to, name))
                    .await
                    .map_err(BuildError::from);
                match copied {
                    Ok(image_id) => image_id,
                    Err(error) => {
                        if may_have_created(&error) {
                            if let Some(image_id) = orphaned_image(provider, to, name).await {
                                warn!(image_id = %image_id, "Copy exists despite failed request");
                                ledger.lock().insert(
                                    target.clone(),
                                    CopiedImage {
                                        image_id,
                                        snapshot_ids: Vec::new(),
                                    },
                                );
                            }
                        }
                        return Err(error);
                    }
                }
            };
            info!(image_id = %image_id, "Copy started");
            ledger.lock().insert(
                target.clone(),
                CopiedImage {
                    image_id: image_id.clone(),
                    snapshot_ids: Vec::new(),
                },
            );

            let available = waiter.image_available(&cancel, &target, &image_id).await;
            match available {
                Ok(image) => {
                    let copied = CopiedImage {
                        image_id,
                        snapshot_ids: image.snapshot_ids,
                    };
                    ledger.lock().insert(target, copied.clone());
                    Ok::<_, BuildError>(copied)
                }
                Err(wait_error) => {
                    warn!(image_id = %image_id, error = %wait_error, "Copy never became available, removing it");
                    let snapshots = snapshots_of(provider, &target, &image_id).await;
                    let removed = remove_image(
                        provider,
                        &teardown_retrier(&retrier),
                        &CancellationToken::new(),
                        &target,
                        &image_id,
                        &snapshots,
                    )
                    .await;
                    match removed {
                        Ok(()) => {
                            ledger.lock().remove(&target);
                        }
                        Err(error) => {
                            warn!(image_id = %image_id, error = %error, "Failed to remove copy");
                        }
                    }
                    Err(BuildError::from(wait_error))
                }
            }
        })
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let config = self.services.config.as_ref();
        let ui = self.services.ui.as_ref();
        let targets = config.copy_targets();
        if targets.is_empty() {
            return Ok(());
        }

        let source_image = state
            .get(&keys::IMAGES)?
            .get(&config.region)
            .cloned()
            .ok_or_else(|| {
                BuildError::precondition(format!("no image was created in {}", config.region))
            })?;

        ui.say(&format!(
            "Copying image {source_image} to {} region(s): {}",
            targets.len(),
            targets.join(", ")
        ));
        let tasks = targets
            .iter()
            .map(|target| self.copy_task(&source_image, target))
            .collect();
        let (succeeded, error) = self.services.replicator.run_all(cancel, tasks).await.into_parts();

        let images = state.get_mut(&keys::IMAGES)?;
        for (region, copy) in &succeeded {
            ui.message(&format!("{region}: {}", copy.image_id));
            images.insert(region.clone(), copy.image_id.clone());
        }
        let mut snapshots = state.take(&keys::SNAPSHOTS)?.unwrap_or_default();
        for (region, copy) in succeeded {
            snapshots.insert(region, copy.snapshot_ids);
        }
        state.put(&keys::SNAPSHOTS, snapshots)?;

        match error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Step for RegionCopyStep {
    fn name(&self) -> &str {
        "region_copy"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }

    async fn cleanup(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        if !keys::build_failed(state) {
            return Ok(());
        }
        let remaining: Vec<(String, CopiedImage)> = self
            .copies
            .lock()
            .iter()
            .map(|(region, copy)| (region.clone(), copy.clone()))
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let provider = self.services.provider.as_ref();
        let teardown = self.services.teardown_retrier();
        self.services
            .ui
            .say("Deregistering copied images because of cancellation or error...");

        let mut failures = Vec::new();
        for (region, copy) in remaining {
            let snapshots = if copy.snapshot_ids.is_empty() {
                snapshots_of(provider, &region, &copy.image_id).await
            } else {
                copy.snapshot_ids
            };
            match remove_image(provider, &teardown, cancel, &region, &copy.image_id, &snapshots).await {
                Ok(()) => {
                    self.copies.lock().remove(&region);
                    if let Ok(images) = state.get_mut(&keys::IMAGES) {
                        images.remove(&region);
                    }
                    if let Ok(snapshots) = state.get_mut(&keys::SNAPSHOTS) {
                        snapshots.remove(&region);
                    }
                }
                Err(error) => failures.push(format!("{region}: {error}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Internal(format!(
                "failed to remove copied images: {}",
                failures.join("; ")
            )))
        }
    }
}
