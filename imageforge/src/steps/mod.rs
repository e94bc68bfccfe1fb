//! The step catalog for an EBS-style image build.
//!
//! This module provides:
//! - [`StepServices`], the collaborators every catalog step shares
//! - One [`Step`](crate::step::Step) per provisioning phase, from source
//!   image lookup to tagging the finished artifacts
//!
//! Each step documents the state keys it reads and publishes. Resources a
//! step creates are remembered on the step itself, so its cleanup works
//! even when the run stopped halfway through `run`. Every cleanup is
//! idempotent.

mod create_image;
mod deregister_image;
mod key_pair;
mod launch_instance;
mod region_copy;
mod security_group;
mod source_image;
mod stop_instance;
mod tag_resources;


pub use create_image::CreateImageStep;
pub use deregister_image::DeregisterImageStep;
pub use key_pair::KeyPairStep;
pub use launch_instance::LaunchInstanceStep;
pub use region_copy::{CopiedImage, RegionCopyStep};
pub use security_group::SecurityGroupStep;
pub use source_image::SourceImageStep;
pub use stop_instance::StopInstanceStep;
pub use tag_resources::TagResourcesStep;

use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::cancellation::CancellationToken;
use crate::config::BuildConfig;
use crate::errors::{BuildError, Classify, ErrorClass};
use crate::provider::{ImageProvider, ProviderError, ProviderResult};
use crate::replication::Replicator;
use crate::retry::{RetryError, Retrier};
use crate::ui::Ui;
use crate::waiter::ResourceWaiter;

/// Collaborators shared by the catalog steps.
#[derive(Clone)]
pub struct StepServices {
    /// The compute provider.
    pub provider: Arc<dyn ImageProvider>,
    /// Operator narration.
    pub ui: Arc<dyn Ui>,
    /// The validated build configuration.
    pub config: Arc<BuildConfig>,
    /// Retrier for lookups, polls and idempotent calls. Retries throttling,
    /// transient errors and not-yet-visible resources.
    pub retrier: Retrier<ProviderError>,
    /// Retrier for calls that create resources. Only retries errors the
    /// provider raises before acting.
    pub creator: Retrier<ProviderError>,
    /// Polls provider resources into their target states.
    pub waiter: ResourceWaiter,
    /// Fan-out for per-region work.
    pub replicator: Replicator,
}

impl std::fmt::Debug for StepServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepServices")
            .field("config", &self.config)
            .field("retrier", &self.retrier)
            .field("creator", &self.creator)
            .field("waiter", &self.waiter)
            .field("replicator", &self.replicator)
            .finish_non_exhaustive()
    }
}

impl StepServices {
    /// Builds the services for a configuration.
    #[must_use]
    pub fn new(provider: Arc<dyn ImageProvider>, ui: Arc<dyn Ui>, config: Arc<BuildConfig>) -> Self {
        let retrier = Retrier::classified(config.retry);
        Self {
            creator: create_retrier(&retrier),
            retrier,
            waiter: ResourceWaiter::new(Arc::clone(&provider), config.wait),
            replicator: Replicator::new(config.replication),
            provider,
            ui,
            config,
        }
    }

    /// Runs a forward provider call under the forward retrier.
    ///
    /// # Errors
    ///
    /// Returns the last provider error once retrying stops.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, operation: F) -> Result<T, BuildError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        self.retrier
            .run(cancel, operation)
            .await
            .map_err(BuildError::from)
    }

    /// Runs a provider call that creates a resource.
    ///
    /// A transient failure may arrive after the provider already created
    /// the resource, so only throttling and not-yet-visible dependencies
    /// are retried. Callers look the resource up by name when this fails.
    ///
    /// # Errors
    ///
    /// Returns the last provider error once retrying stops.
    pub async fn create<T, F, Fut>(&self, cancel: &CancellationToken, operation: F) -> Result<T, BuildError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        self.creator
            .run(cancel, operation)
            .await
            .map_err(BuildError::from)
    }

    /// Returns the retrier used to delete resources.
    ///
    /// Unlike the forward retrier it does not retry `NotFound`: a resource
    /// that is gone needs no deleting.
    #[must_use]
    pub fn teardown_retrier(&self) -> Retrier<ProviderError> {
        teardown_retrier(&self.retrier)
    }
}

pub(crate) fn create_retrier(forward: &Retrier<ProviderError>) -> Retrier<ProviderError> {
    Retrier::new(*forward.policy(), |err: &ProviderError| {
        matches!(err.class, ErrorClass::Throttled | ErrorClass::NotFound)
    })
}

pub(crate) fn teardown_retrier(forward: &Retrier<ProviderError>) -> Retrier<ProviderError> {
    Retrier::new(*forward.policy(), |err: &ProviderError| {
        matches!(err.class, ErrorClass::Throttled | ErrorClass::Transient)
    })
}

/// Retrier for deleting a resource another resource may still hold on to.
pub(crate) fn dependent_teardown_retrier(forward: &Retrier<ProviderError>) -> Retrier<ProviderError> {
    Retrier::new(*forward.policy(), |err: &ProviderError| {
        matches!(
            err.class,
            ErrorClass::Throttled | ErrorClass::Transient | ErrorClass::DependencyViolation
        )
    })
}

/// Maps the outcome of a delete, treating an already missing resource as
/// deleted.
pub(crate) fn deleted(
    resource: &str,
    outcome: Result<(), RetryError<ProviderError>>,
) -> Result<(), BuildError> {
    match outcome {
        Ok(()) => Ok(()),
        Err(RetryError::Rejected { error, .. }) if error.is_not_found() => {
            debug!(resource, "Already gone");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Deregisters an image, then deletes the snapshots that backed it.
///
/// Missing resources count as removed. Stops at the first other failure.
pub(crate) async fn remove_image(
    provider: &dyn ImageProvider,
    teardown: &Retrier<ProviderError>,
    cancel: &CancellationToken,
    region: &str,
    image_id: &str,
    snapshot_ids: &[String],
) -> Result<(), BuildError> {
    let outcome = teardown
        .run(cancel, move || provider.deregister_image(region, image_id))
        .await;
    deleted(image_id, outcome)?;

    for snapshot in snapshot_ids {
        let snapshot = snapshot.as_str();
        let outcome = teardown
            .run(cancel, move || provider.delete_snapshot(region, snapshot))
            .await;
        deleted(snapshot, outcome)?;
    }
    debug!(region, image_id, snapshots = snapshot_ids.len(), "Image removed");
    Ok(())
}

/// Returns true if a create call that failed this way may still have
/// created its resource: the response was lost, or the call was abandoned
/// mid-flight.
pub(crate) fn may_have_created(error: &BuildError) -> bool {
    matches!(error, BuildError::Cancelled { .. }) || error.class() == ErrorClass::Transient
}

/// Best-effort lookup of an image a failed create call registered anyway.
pub(crate) async fn orphaned_image(provider: &dyn ImageProvider, region: &str, name: &str) -> Option<String> {
    match provider.find_image_by_name(region, name).await {
        Ok(found) => found.map(|image| image.id),
        Err(error) => {
            debug!(region, name, error = %error, "Could not look up image by name");
            None
        }
    }
}

/// Best-effort lookup of the snapshots behind an image.
pub(crate) async fn snapshots_of(provider: &dyn ImageProvider, region: &str, image_id: &str) -> Vec<String> {
    match provider.describe_image(region, image_id).await {
        Ok(image) => image.snapshot_ids,
        Err(error) => {
            debug!(region, image_id, error = %error, "Could not list image snapshots");
            Vec::new()
        }
    }
}
