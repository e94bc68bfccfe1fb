//! Worker instance launch and termination.

use async_trait::async_trait;
use tracing::info;

use super::{deleted, StepServices};
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::provider::{InstanceState, LaunchRequest};
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

/// Launches the worker instance and waits until it is running.
///
/// Reads: [`keys::BUILD`], [`keys::SOURCE_IMAGE`], [`keys::KEY_PAIR`],
/// [`keys::SECURITY_GROUPS`]. Publishes: [`keys::INSTANCE`].
///
/// A freshly created key pair or security group may not be visible to the
/// launch call yet; those `NotFound` errors are retried. The launch carries
/// a client token unique to the build, so a retry after a lost response
/// returns the instance already launched instead of starting another. The instance id is
/// remembered as soon as the launch returns, so an instance that never
/// reaches `running` is still terminated by cleanup.
#[derive(Debug)]
pub struct LaunchInstanceStep {
    services: StepServices,
    launched: Option<String>,
}

impl LaunchInstanceStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self {
            services,
            launched: None,
        }
    }

    fn launch_request(&self, state: &StateBag) -> Result<LaunchRequest, BuildError> {
        let config = self.services.config.as_ref();
        let build = state.get(&keys::BUILD)?;
        let mut tags = build.tags();
        tags.insert("Name".to_string(), "imageforge builder".to_string());

        Ok(LaunchRequest {
            region: config.region.clone(),
            source_image: state.get(&keys::SOURCE_IMAGE)?.id.clone(),
            instance_type: config.instance_type.clone(),
            key_name: state.get(&keys::KEY_PAIR)?.name.clone(),
            security_group_ids: state.get(&keys::SECURITY_GROUPS)?.clone(),
            tags,
            client_token: Some(build.temporary_name("launch")),
        })
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let request = self.launch_request(state)?;
        let provider = self.services.provider.as_ref();
        let ui = self.services.ui.as_ref();

        ui.say("Launching a source instance...");
        let launched = {
            let request = &request;
            self.services
                .call(cancel, move || provider.run_instance(request))
                .await?
        };
        self.launched = Some(launched.id.clone());
        ui.message(&format!("Instance ID: {}", launched.id));

        ui.say(&format!("Waiting for instance ({}) to become ready...", launched.id));
        let running = self
            .services
            .waiter
            .instance_state(cancel, &request.region, &launched.id, InstanceState::Running)
            .await?;

        if let Some(ip) = &running.public_ip {
            ui.message(&format!("Public IP: {ip}"));
        }
        info!(region = %request.region, instance_id = %running.id, "Instance running");
        state.put(&keys::INSTANCE, running)?;
        Ok(())
    }
}

#[async_trait]
impl Step for LaunchInstanceStep {
    fn name(&self) -> &str {
        "launch_instance"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }

    async fn cleanup(&mut self, cancel: &CancellationToken, _state: &mut StateBag) -> Result<(), BuildError> {
        let Some(instance_id) = self.launched.clone() else {
            return Ok(());
        };
        let provider = self.services.provider.as_ref();
        let region = self.services.config.region.as_str();
        let id = instance_id.as_str();

        self.services.ui.say("Terminating the source instance...");
        let outcome = self
            .services
            .teardown_retrier()
            .run(cancel, move || provider.terminate_instance(region, id))
            .await;
        deleted(id, outcome)?;

        self.services
            .waiter
            .instance_terminated(cancel, region, id)
            .await?;
        info!(region, instance_id = %id, "Instance terminated");

        self.launched = None;
        Ok(())
    }
}
