//! Polling until a resource reaches a desired state.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::cancellation::CancellationToken;
use crate::errors::{Classify, ConfigError, ErrorClass};
use crate::provider::{
    ImageInfo, ImageProvider, ImageState, InstanceInfo, InstanceState, ProviderError,
};

fn default_max_attempts() -> u32 {
    40
}

fn default_delay_ms() -> u64 {
    15_000
}

/// Polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Maximum number of probes.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between probes, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl WaitConfig {
    /// Creates a config.
    #[must_use]
    pub const fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
        }
    }

    /// Returns the delay between probes.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Checks the config.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if no probe would ever run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("wait.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// The result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T = ()> {
    /// The resource reached the desired state.
    Ready(T),
    /// Not there yet; carries the observed state.
    Pending(String),
    /// The resource reached a state it will never leave.
    Failed(String),
}

/// Why waiting for a resource ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The probe budget ran out.
    #[error("timed out waiting for {resource} after {attempts} probe(s), last state: {last_state}")]
    Timeout {
        /// What was being waited on.
        resource: String,
        /// Probes made.
        attempts: u32,
        /// Last observed state.
        last_state: String,
    },

    /// The resource reached a terminal state.
    #[error("{resource} entered terminal state {state}")]
    Failed {
        /// What was being waited on.
        resource: String,
        /// The terminal state.
        state: String,
    },

    /// A probe failed with a non-retryable error.
    #[error("probing {resource} failed: {error}")]
    Probe {
        /// What was being waited on.
        resource: String,
        /// The provider error.
        error: ProviderError,
    },

    /// The token fired while waiting.
    #[error("wait for {resource} cancelled: {reason}")]
    Cancelled {
        /// What was being waited on.
        resource: String,
        /// The cancellation reason.
        reason: String,
    },
}

impl Classify for WaitError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::Probe { error, .. } => error.class,
            Self::Failed { .. } | Self::Cancelled { .. } => ErrorClass::Fatal,
        }
    }
}

/// Polls `probe` until it reports ready, fails, or the budget runs out.
///
/// Returns the value carried by the ready probe. Retryable probe errors
/// (throttling, not-yet-visible resources) count as pending. The first
/// probe runs immediately; the delay is only slept between probes.
///
/// # Errors
///
/// Returns a `WaitError` describing why waiting stopped.
pub async fn wait_until<T, F, Fut>(
    cancel: &CancellationToken,
    config: &WaitConfig,
    resource: &str,
    mut probe: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, ProviderError>>,
{
    let cancelled = |reason: String| WaitError::Cancelled {
        resource: resource.to_string(),
        reason,
    };
    let mut last_state = String::from("unknown");

    for attempt in 1..=config.max_attempts.max(1) {
        let outcome = cancel
            .guard(probe())
            .await
            .map_err(|c| cancelled(c.reason))?;

        match outcome {
            Ok(Probe::Ready(value)) => {
                debug!(resource, attempt, "Resource ready");
                return Ok(value);
            }
            Ok(Probe::Failed(state)) => {
                return Err(WaitError::Failed {
                    resource: resource.to_string(),
                    state,
                });
            }
            Ok(Probe::Pending(state)) => {
                debug!(resource, attempt, state = %state, "Resource not ready");
                last_state = state;
            }
            Err(error) if error.is_retryable() => {
                debug!(resource, attempt, error = %error, "Probe failed, will poll again");
                last_state = error.code.clone();
            }
            Err(error) => {
                return Err(WaitError::Probe {
                    resource: resource.to_string(),
                    error,
                });
            }
        }

        if attempt < config.max_attempts {
            cancel
                .sleep(config.delay())
                .await
                .map_err(|c| cancelled(c.reason))?;
        }
    }

    Err(WaitError::Timeout {
        resource: resource.to_string(),
        attempts: config.max_attempts.max(1),
        last_state,
    })
}

/// Provider-backed waits used by the step catalog.
#[derive(Clone)]
pub struct ResourceWaiter {
    provider: Arc<dyn ImageProvider>,
    config: WaitConfig,
}

impl std::fmt::Debug for ResourceWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWaiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResourceWaiter {
    /// Creates a waiter.
    #[must_use]
    pub fn new(provider: Arc<dyn ImageProvider>, config: WaitConfig) -> Self {
        Self { provider, config }
    }

    /// Returns the polling budget.
    #[must_use]
    pub const fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Waits until an instance reaches `target`.
    ///
    /// Reaching a terminal state while waiting for anything other than
    /// `Terminated` fails immediately.
    ///
    /// # Errors
    ///
    /// Returns a `WaitError` if the instance never gets there.
    pub async fn instance_state(
        &self,
        cancel: &CancellationToken,
        region: &str,
        instance_id: &str,
        target: InstanceState,
    ) -> Result<InstanceInfo, WaitError> {
        info!(region, instance_id, target = %target, "Waiting for instance");
        let resource = format!("instance {instance_id}");

        wait_until(cancel, &self.config, &resource, || async {
            let instance = self.provider.describe_instance(region, instance_id).await?;
            Ok(if instance.state == target {
                Probe::Ready(instance)
            } else if instance.state.is_terminal() && target != InstanceState::Terminated {
                Probe::Failed(instance.state.to_string())
            } else {
                Probe::Pending(instance.state.to_string())
            })
        })
        .await
    }

    /// Waits until an instance is gone.
    ///
    /// An instance the provider no longer knows about counts as terminated.
    ///
    /// # Errors
    ///
    /// Returns a `WaitError` if termination never completes.
    pub async fn instance_terminated(
        &self,
        cancel: &CancellationToken,
        region: &str,
        instance_id: &str,
    ) -> Result<(), WaitError> {
        let resource = format!("instance {instance_id}");
        wait_until(cancel, &self.config, &resource, || async {
            match self.provider.describe_instance(region, instance_id).await {
                Ok(instance) if instance.state == InstanceState::Terminated => Ok(Probe::Ready(())),
                Ok(instance) => Ok(Probe::Pending(instance.state.to_string())),
                Err(error) if error.is_not_found() => Ok(Probe::Ready(())),
                Err(error) => Err(error),
            }
        })
        .await
    }

    /// Waits until an image is available and returns its description.
    ///
    /// # Errors
    ///
    /// Returns a `WaitError` if the image fails or never becomes available.
    pub async fn image_available(
        &self,
        cancel: &CancellationToken,
        region: &str,
        image_id: &str,
    ) -> Result<ImageInfo, WaitError> {
        info!(region, image_id, "Waiting for image to become available");
        let resource = format!("image {image_id} in {region}");

        wait_until(cancel, &self.config, &resource, || async {
            let image = self.provider.describe_image(region, image_id).await?;
            Ok(match image.state {
                ImageState::Available => Probe::Ready(image),
                ImageState::Failed => Probe::Failed(image.state.to_string()),
                ImageState::Pending => Probe::Pending(image.state.to_string()),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> WaitConfig {
        WaitConfig::new(5, 100)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_pending() {
        let probes = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        wait_until(&CancellationToken::new(), &quick(), "image", || async {
            if probes.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(Probe::Pending("pending".into()))
            } else {
                Ok(Probe::Ready(()))
            }
        })
        .await
        .unwrap();

        assert_eq!(probes.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_state() {
        let err = wait_until(&CancellationToken::new(), &quick(), "image", || async {
            Ok(Probe::<()>::Pending("pending".into()))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err,
            WaitError::Timeout {
                resource: "image".into(),
                attempts: 5,
                last_state: "pending".into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_counts_as_pending() {
        let probes = AtomicU32::new(0);
        wait_until(&CancellationToken::new(), &quick(), "instance", || async {
            if probes.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::not_found("InvalidInstanceID.NotFound", "not yet"))
            } else {
                Ok(Probe::Ready(7))
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_fatal_probe_error_stops() {
        let err = wait_until(&CancellationToken::new(), &quick(), "instance", || async {
            Err::<Probe, _>(ProviderError::fatal("AuthFailure", "denied"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WaitError::Probe { .. }));
    }

    #[tokio::test]
    async fn test_terminal_state_fails() {
        let err = wait_until(&CancellationToken::new(), &quick(), "instance", || async {
            Ok(Probe::<()>::Failed("terminated".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WaitError::Failed { .. }));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel("interrupt");
        });

        let config = WaitConfig::new(1000, 60_000);
        let err = wait_until(&cancel, &config, "image", || async {
            Ok(Probe::<()>::Pending("pending".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled { .. }));
    }

    #[test]
    fn test_config_validate() {
        assert!(WaitConfig::default().validate().is_ok());
        assert!(WaitConfig::new(0, 10).validate().is_err());
    }
}
