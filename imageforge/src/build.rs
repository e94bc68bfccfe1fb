//! The image build: configuration, provider and the step catalog wired into
//! a pipeline.
//!
//! This module provides:
//! - [`ImageBuild`], the entry point that validates a [`BuildConfig`],
//!   assembles the catalog steps in provisioning order and runs them
//!
//! Step order follows the lifecycle of an EBS-backed build: inspect the
//! source, create access resources, launch and stop a worker, image it,
//! replicate the image and tag everything it produced. Cleanup runs in
//! reverse, so the worker is terminated before its security group is
//! deleted.

use std::sync::Arc;
use tracing::{info, info_span, Instrument};

use crate::artifact::Artifact;
use crate::cancellation::CancellationToken;
use crate::config::BuildConfig;
use crate::errors::BuildError;
use crate::identity::BuildIdentity;
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineReport, Runner};
use crate::provider::ImageProvider;
use crate::state::{keys, StateBag};
use crate::steps::{
    CreateImageStep, DeregisterImageStep, KeyPairStep, LaunchInstanceStep, RegionCopyStep,
    SecurityGroupStep, SourceImageStep, StepServices, StopInstanceStep, TagResourcesStep,
};
use crate::ui::{TracingUi, Ui};

/// Pipeline name used in logs and reports.
pub const PIPELINE_NAME: &str = "imageforge";

/// A validated image build, ready to run.
pub struct ImageBuild {
    config: Arc<BuildConfig>,
    provider: Arc<dyn ImageProvider>,
    ui: Arc<dyn Ui>,
}

impl std::fmt::Debug for ImageBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuild")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ImageBuild {
    /// Validates the configuration and creates the build.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] if the configuration is invalid.
    pub fn new(config: BuildConfig, provider: Arc<dyn ImageProvider>) -> Result<Self, BuildError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            provider,
            ui: Arc::new(TracingUi),
        })
    }

    /// Sets the operator UI.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn Ui>) -> Self {
        self.ui = ui;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Assembles the step catalog into a pipeline.
    ///
    /// The region copy step is only added when there is at least one copy
    /// region other than the build region.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Validation`] if the pipeline is malformed.
    pub fn pipeline(&self) -> Result<Pipeline, BuildError> {
        let services = StepServices::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.ui),
            Arc::clone(&self.config),
        );
        let copies = !self.config.copy_targets().is_empty();

        let pipeline = PipelineBuilder::new(PIPELINE_NAME)
            .step(Box::new(SourceImageStep::new(services.clone())))
            .step(Box::new(KeyPairStep::new(services.clone())))
            .step(Box::new(SecurityGroupStep::new(services.clone())))
            .step(Box::new(LaunchInstanceStep::new(services.clone())))
            .step(Box::new(StopInstanceStep::new(services.clone())))
            .step(Box::new(DeregisterImageStep::new(services.clone())))
            .step(Box::new(CreateImageStep::new(services.clone())))
            .step_if(copies, || Box::new(RegionCopyStep::new(services.clone())))
            .step(Box::new(TagResourcesStep::new(services)))
            .build()?;
        Ok(pipeline)
    }

    /// Runs the build and returns the full report.
    ///
    /// A fresh [`BuildIdentity`] is generated for every run.
    ///
    /// # Errors
    ///
    /// Returns an error only if the run could not be started. Failures of
    /// the build itself are in the report.
    pub async fn run_report(&self, cancel: &CancellationToken) -> Result<PipelineReport, BuildError> {
        let identity = BuildIdentity::new();
        let pipeline = self.pipeline()?;
        let mut state = StateBag::new();
        state.put(&keys::BUILD, identity.clone())?;

        let span = info_span!(
            "build",
            build_id = %identity.build_id,
            image = %self.config.image_name,
        );
        info!(
            parent: &span,
            region = %self.config.region,
            copies = self.config.copy_targets().len(),
            steps = pipeline.len(),
            "Starting image build"
        );

        let report = Runner::new(pipeline)
            .with_config(self.config.runner_config())
            .with_ui(Arc::clone(&self.ui))
            .run(cancel, state)
            .instrument(span)
            .await;
        Ok(report)
    }

    /// Runs the build and returns the artifact.
    ///
    /// # Errors
    ///
    /// Returns the halting error, or [`BuildError::Cancelled`], when the
    /// build did not complete. Every resource the build created has been
    /// cleaned up by then.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Artifact, BuildError> {
        let state = self.run_report(cancel).await?.into_result()?;
        let artifact = Artifact::from_state(&state)?;
        self.ui.say(&artifact.to_string());
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;
    use crate::identity::BUILD_ID_TAG;
    use crate::pipeline::RunState;
    use crate::provider::ProviderError;
    use crate::retry::RetryPolicy;
    use crate::testing::{CollectingUi, InMemoryProvider, ProviderOp, Simulation};
    use crate::waiter::WaitConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> BuildConfig {
        BuildConfig::new("web-image", "ami-source", "us-east-1")
            .with_retry(
                RetryPolicy::new()
                    .with_max_attempts(5)
                    .with_initial_delay_ms(10)
                    .with_max_delay_ms(100),
            )
            .with_wait(WaitConfig::new(20, 100))
    }

    fn provider() -> Arc<InMemoryProvider> {
        Arc::new(
            InMemoryProvider::new()
                .with_image("us-east-1", "ami-source", "base")
                .with_simulation(Simulation {
                    visibility_lag: 1,
                    image_pending_polls: 2,
                    instance_pending_polls: 2,
                }),
        )
    }

    fn build(provider: &Arc<InMemoryProvider>, config: BuildConfig) -> (ImageBuild, Arc<CollectingUi>) {
        let ui = Arc::new(CollectingUi::new());
        let build = ImageBuild::new(config, provider.clone())
            .unwrap()
            .with_ui(ui.clone());
        (build, ui)
    }

    fn assert_no_leftovers(provider: &InMemoryProvider) {
        assert!(provider.live_instances().is_empty());
        assert_eq!(provider.security_group_count(), 0);
        assert_eq!(
            provider.call_count(ProviderOp::CreateKeyPair),
            provider.call_count(ProviderOp::DeleteKeyPair)
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.image_name = "x".into();

        let err = ImageBuild::new(config, provider()).unwrap_err();
        assert!(matches!(err, BuildError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_pipeline_order() {
        let (build, _ui) = build(&provider(), config().with_copy_regions(["eu-west-1"]));
        let pipeline = build.pipeline().unwrap();

        assert_eq!(
            pipeline.step_names(),
            vec![
                "source_image",
                "key_pair",
                "security_group",
                "launch_instance",
                "stop_instance",
                "deregister_image",
                "create_image",
                "region_copy",
                "tag_resources",
            ]
        );
    }

    #[test]
    fn test_pipeline_without_copies_skips_region_copy() {
        let (build, _ui) = build(&provider(), config().with_copy_regions(["us-east-1"]));

        let names = build.pipeline().unwrap().step_names().join(",");
        assert!(!names.contains("region_copy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_build_with_copies() {
        let provider = provider();
        let (build, ui) = build(
            &provider,
            config()
                .with_copy_regions(["eu-west-1", "ap-south-1"])
                .with_tag("team", "infra"),
        );

        let artifact = build.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(artifact.regions(), vec!["ap-south-1", "eu-west-1", "us-east-1"]);
        for (region, image_id) in &artifact.images {
            assert!(provider.has_image(region, image_id));
            let tags = provider.tags_of(region, image_id);
            assert_eq!(tags["team"], "infra");
            assert_eq!(tags[BUILD_ID_TAG], artifact.build_id.to_string());
            for snapshot in &artifact.snapshots[region] {
                assert!(provider.has_snapshot(region, snapshot));
            }
        }
        assert_no_leftovers(&provider);
        assert!(ui.contains("Images were created"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_records_every_step() {
        let provider = provider();
        let (build, _ui) = build(&provider, config());

        let report = build.run_report(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.pipeline, PIPELINE_NAME);
        assert_eq!(report.started_steps().len(), 8);
        assert!(report.cleanup.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_copy_removes_everything() {
        let provider = provider();
        provider.fail_in_region(
            ProviderOp::CopyImage,
            "ap-south-1",
            ProviderError::fatal("InvalidRegion", "region disabled"),
        );
        let (build, _ui) = build(&provider, config().with_copy_regions(["eu-west-1", "ap-south-1"]));

        let report = build.run_report(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.state, RunState::Halted);
        assert!(matches!(
            report.error,
            Some(BuildError::Step { ref step, .. }) if step == "region_copy"
        ));
        assert!(report.cleanup.is_clean());
        assert_eq!(provider.image_ids("us-east-1"), vec!["ami-source".to_string()]);
        assert!(provider.image_ids("eu-west-1").is_empty());
        assert!(provider.image_ids("ap-south-1").is_empty());
        assert_eq!(provider.call_count(ProviderOp::DeleteSnapshot), 2);
        assert_no_leftovers(&provider);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_image_halts_before_any_resource_is_created() {
        let provider = Arc::new(
            InMemoryProvider::new()
                .with_image("us-east-1", "ami-source", "base")
                .with_image("us-east-1", "ami-old", "web-image"),
        );
        let (build, _ui) = build(&provider, config());

        let err = build.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BuildError::Step { ref step, .. } if step == "source_image"));
        assert_eq!(provider.call_count(ProviderOp::CreateKeyPair), 0);
        assert!(provider.has_image("us-east-1", "ami-old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_deregister_replaces_existing_image() {
        let provider = Arc::new(
            InMemoryProvider::new()
                .with_image("us-east-1", "ami-source", "base")
                .with_image("us-east-1", "ami-old", "web-image"),
        );
        let mut config = config();
        config.force_deregister = true;
        config.force_delete_snapshot = true;
        let (build, _ui) = build(&provider, config);

        let artifact = build.run(&CancellationToken::new()).await.unwrap();

        assert!(!provider.has_image("us-east-1", "ami-old"));
        assert!(!provider.has_snapshot("us-east-1", "snap-ami-old"));
        assert_ne!(artifact.image("us-east-1"), Some("ami-old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_cleans_up() {
        let provider = provider();
        provider.set_latency(ProviderOp::CreateImage, Duration::from_secs(600));
        let mut config = config();
        config.cancel_grace_ms = 1_000;
        let (build, ui) = build(&provider, config);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel("operator interrupt");
        });
        let report = build.run_report(&cancel).await.unwrap();

        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.cancel_reason.as_deref(), Some("operator interrupt"));
        assert!(matches!(report.error, Some(BuildError::Cancelled { .. })));
        assert_eq!(provider.image_ids("us-east-1"), vec!["ami-source".to_string()]);
        assert_no_leftovers(&provider);
        assert!(ui.contains("Build was cancelled: operator interrupt"));
    }
}
