//! Temporary security group for the worker instance.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{deleted, dependent_teardown_retrier, may_have_created, StepServices};
use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::state::{keys, StateBag};
use crate::step::{finish, Step, StepAction};

/// Provides the security groups the worker instance is launched with.
///
/// Reads: [`keys::BUILD`]. Publishes: [`keys::SECURITY_GROUPS`].
///
/// Uses `security_group_ids` from the configuration when set; otherwise
/// creates a temporary group that admits `ssh_cidr` on `ssh_port`. If the
/// ingress rule cannot be added the group is deleted before the step halts.
/// A failed create is followed by a lookup by name, so a group the provider
/// created before the failure is still deleted by cleanup. Cleanup keeps
/// retrying while the group is still attached to an instance that is
/// shutting down.
#[derive(Debug)]
pub struct SecurityGroupStep {
    services: StepServices,
    created: Option<String>,
}

impl SecurityGroupStep {
    /// Creates the step.
    #[must_use]
    pub fn new(services: StepServices) -> Self {
        Self {
            services,
            created: None,
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let config = self.services.config.as_ref();
        let ui = self.services.ui.as_ref();

        if !config.security_group_ids.is_empty() {
            ui.say(&format!(
                "Using existing security groups: {}",
                config.security_group_ids.join(", ")
            ));
            state.put(&keys::SECURITY_GROUPS, config.security_group_ids.clone())?;
            return Ok(());
        }

        let name = state.get(&keys::BUILD)?.temporary_name("security_group");
        let provider = self.services.provider.as_ref();
        let region = config.region.as_str();
        let port = config.ssh_port;
        let cidr = config.ssh_cidr.as_str();

        ui.say("Creating temporary security group for this instance...");
        let created = {
            let name = name.as_str();
            self.services
                .create(cancel, move || {
                    provider.create_security_group(region, name, "Temporary group for imageforge")
                })
                .await
        };
        let group_id = match created {
            Ok(group_id) => group_id,
            Err(error) => {
                if may_have_created(&error) {
                    self.created = self.orphaned_group(region, &name).await;
                }
                return Err(error);
            }
        };

        ui.message(&format!("Authorizing access to port {port} from {cidr}"));
        let authorized = {
            let group = group_id.as_str();
            self.services
                .call(cancel, move || provider.authorize_ingress(region, group, port, cidr))
                .await
        };

        if let Err(error) = authorized {
            warn!(region, group_id = %group_id, error = %error, "Ingress rule failed, deleting group");
            let group = group_id.as_str();
            let outcome = self
                .services
                .teardown_retrier()
                .run(&CancellationToken::new(), move || {
                    provider.delete_security_group(region, group)
                })
                .await;
            if let Err(cleanup_error) = deleted(group, outcome) {
                ui.error(&format!(
                    "Failed to delete security group {group_id}: {cleanup_error}"
                ));
                self.created = Some(group_id);
            }
            return Err(error);
        }

        info!(region, group_id = %group_id, "Temporary security group created");
        self.created = Some(group_id.clone());
        state.put(&keys::SECURITY_GROUPS, vec![group_id])?;
        Ok(())
    }

    async fn orphaned_group(&self, region: &str, name: &str) -> Option<String> {
        let provider = self.services.provider.as_ref();
        match provider.find_security_group(region, name).await {
            Ok(Some(group_id)) => {
                warn!(region, group_id = %group_id, "Security group exists despite failed create");
                Some(group_id)
            }
            Ok(None) => None,
            Err(error) => {
                debug!(region, name, error = %error, "Could not look up security group");
                None
            }
        }
    }
}

#[async_trait]
impl Step for SecurityGroupStep {
    fn name(&self) -> &str {
        "security_group"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(self.name(), self.services.ui.as_ref(), state, result)
    }

    async fn cleanup(&mut self, cancel: &CancellationToken, _state: &mut StateBag) -> Result<(), BuildError> {
        let Some(group_id) = self.created.clone() else {
            return Ok(());
        };
        let provider = self.services.provider.as_ref();
        let region = self.services.config.region.as_str();
        let group = group_id.as_str();

        self.services.ui.say("Deleting temporary security group...");
        let outcome = dependent_teardown_retrier(&self.services.retrier)
            .run(cancel, move || provider.delete_security_group(region, group))
            .await;
        deleted(group, outcome)?;

        self.created = None;
        Ok(())
    }
}
