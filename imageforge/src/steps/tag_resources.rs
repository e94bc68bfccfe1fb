//! Tagging produced images and snapshots.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::StepServices;
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::replication::ReplicationTask;
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

/// Tags every produced image and its snapshots, one region per target.
///
/// Reads: [`keys::BUILD`], [`keys::IMAGES`], [`keys::SNAPSHOTS`]. Applies
/// the configured tags plus the build identity tags. Copies that were only
/// just registered may not be visible to the tagging call yet, so
/// `NotFound` is retried. No cleanup.
#[derive(Debug)]
pub struct TagResourcesStep {
    services: StepServices,
}

impl TagResourcesStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &StateBag) -> Result<(), BuildError> {
        let mut tags = self.services.config.tags.clone();
        tags.extend(state.get(&keys::BUILD)?.tags());
        let tags = Arc::new(tags);

        let images = state.get(&keys::IMAGES)?;
        let snapshots = state.get_opt(&keys::SNAPSHOTS)?;

        self.services.ui.say(&format!(
            "Adding tags to {} image(s) and their snapshots...",
            images.len()
        ));

        let tasks = images
            .iter()
            .map(|(region, image_id)| {
                let mut resources = vec![image_id.clone()];
                if let Some(ids) = snapshots.and_then(|s| s.get(region)) {
                    resources.extend(ids.iter().cloned());
                }
                self.tag_task(region, resources, Arc::clone(&tags))
            })
            .collect();

        let result = self.services.replicator.run_all(cancel, tasks).await;
        match result.error() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn tag_task(
        &self,
        region: &str,
        resources: Vec<String>,
        tags: Arc<BTreeMap<String, String>>,
    ) -> ReplicationTask<usize> {
        let provider = Arc::clone(&self.services.provider);
        let retrier = self.services.retrier.clone();
        let region = region.to_string();

        ReplicationTask::new(region.clone(), move |cancel| async move {
            let provider = provider.as_ref();
            let (region, resources, tags) = (region.as_str(), resources.as_slice(), tags.as_ref());
            retrier
                .run(&cancel, move || provider.create_tags(region, resources, tags))
                .await
                .map_err(BuildError::from)?;
            Ok::<_, BuildError>(resources.len())
        })
    }
}

#[async_trait]
impl Step for TagResourcesStep {
    fn name(&self) -> &str {
        "tag_resources"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }
}
