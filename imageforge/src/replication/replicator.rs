//! Concurrent fan-out over independent targets.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::ReplicationResult;
use crate::cancellation::CancellationToken;
use crate::errors::{panic_message, BuildError};

type Operation<T> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, BuildError>> + Send>;

/// One unit of fan-out work.
pub struct ReplicationTask<T> {
    target: String,
    operation: Operation<T>,
}

impl<T> ReplicationTask<T> {
    /// Creates a task for `target`.
    pub fn new<F, Fut>(target: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        Self {
            target: target.into(),
            operation: Box::new(move |cancel| operation(cancel).boxed()),
        }
    }

    /// Returns the target id.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl<T> fmt::Debug for ReplicationTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationTask")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Fan-out settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum targets in flight; `None` runs every target at once.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl ReplicationConfig {
    /// Limits the number of targets in flight.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }
}

/// Runs one task per target concurrently and joins them all.
///
/// A failing or panicking target never cancels its siblings; the caller's
/// token is the only way to stop the fan-out early.
#[derive(Debug, Clone, Default)]
pub struct Replicator {
    config: ReplicationConfig,
}

impl Replicator {
    /// Creates a replicator.
    #[must_use]
    pub fn new(config: ReplicationConfig) -> Self {
        Self { config }
    }

    /// Runs every task and waits for all of them.
    ///
    /// Each task runs on its own tokio task. Results are collected per
    /// target; a target whose worker panicked is reported as failed with
    /// the panic message. When two tasks share a target only the first runs.
    pub async fn run_all<T>(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<ReplicationTask<T>>,
    ) -> ReplicationResult<T>
    where
        T: Send + 'static,
    {
        let aggregate: Arc<Mutex<ReplicationResult<T>>> =
            Arc::new(Mutex::new(ReplicationResult::default()));
        let limiter = self
            .config
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        let mut seen = HashSet::new();
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(tasks.len());

        for task in tasks {
            if !seen.insert(task.target.clone()) {
                warn!(target_id = %task.target, "Duplicate replication target ignored");
                continue;
            }

            let target = task.target.clone();
            let span = info_span!("replica", target_id = %target);
            let aggregate = Arc::clone(&aggregate);
            let limiter = limiter.clone();
            let token = cancel.clone();

            let handle = tokio::spawn(
                async move {
                    let _permit = match limiter {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };

                    let outcome = if let Some(reason) = token.reason() {
                        Err(BuildError::cancelled(reason))
                    } else {
                        debug!("Replication started");
                        (task.operation)(token).await
                    };

                    let mut aggregate = aggregate.lock();
                    match outcome {
                        Ok(value) => {
                            info!("Replication succeeded");
                            aggregate.succeeded.insert(task.target, value);
                        }
                        Err(error) => {
                            warn!(error = %error, "Replication failed");
                            aggregate.failed.insert(task.target, error);
                        }
                    }
                }
                .instrument(span),
            );
            handles.push((target, handle));
        }

        for (target, handle) in handles {
            if let Err(join_error) = handle.await {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic().as_ref())
                } else {
                    join_error.to_string()
                };
                warn!(target_id = %target, "Replication worker panicked: {}", message);
                aggregate.lock().failed.insert(
                    target.clone(),
                    BuildError::StepPanicked {
                        step: format!("replicate {target}"),
                        message,
                    },
                );
            }
        }

        let result = std::mem::take(&mut *aggregate.lock());
        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "Replication finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sleepy(target: &str, millis: u64, fail: bool) -> ReplicationTask<String> {
        let id = format!("ami-{target}");
        ReplicationTask::new(target, move |_cancel| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            if fail {
                Err(BuildError::Internal(format!("copy to {id} failed")))
            } else {
                Ok(id)
            }
        })
    }

    #[tokio::test]
    async fn test_scenario_one_of_three_fails() {
        let replicator = Replicator::default();
        let tasks = vec![
            sleepy("us", 30, false),
            sleepy("eu", 5, true),
            sleepy("ap", 15, false),
        ];

        let result = replicator.run_all(&CancellationToken::new(), tasks).await;

        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.succeeded["us"], "ami-us");
        assert_eq!(result.succeeded["ap"], "ami-ap");
        let err = result.error().unwrap();
        assert_eq!(err.targets(), vec!["eu"]);
        assert_eq!(err.attempted, 3);
    }

    #[tokio::test]
    async fn test_counts_independent_of_completion_order() {
        for order in [[1_u64, 20, 40, 60], [60, 40, 20, 1]] {
            let tasks = vec![
                sleepy("a", order[0], false),
                sleepy("b", order[1], true),
                sleepy("c", order[2], false),
                sleepy("d", order[3], true),
            ];
            let result = Replicator::default()
                .run_all(&CancellationToken::new(), tasks)
                .await;

            assert_eq!(result.succeeded.keys().collect::<Vec<_>>(), vec!["a", "c"]);
            assert_eq!(result.failed.keys().collect::<Vec<_>>(), vec!["b", "d"]);
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_becomes_failure() {
        let tasks = vec![
            sleepy("us", 1, false),
            ReplicationTask::new("eu", |_cancel| async move {
                let explode = true;
                if explode {
                    panic!("worker exploded");
                }
                Ok::<_, BuildError>("unreachable".to_string())
            }),
        ];

        let result = Replicator::default()
            .run_all(&CancellationToken::new(), tasks)
            .await;

        assert!(result.succeeded.contains_key("us"));
        let err = &result.failed["eu"];
        assert!(err.to_string().contains("worker exploded"));
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                ReplicationTask::new(format!("r{i}"), move |_cancel| async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), BuildError>(())
                })
            })
            .collect();

        let replicator = Replicator::new(ReplicationConfig::default().with_max_concurrency(2));
        let result = replicator.run_all(&CancellationToken::new(), tasks).await;

        assert_eq!(result.succeeded.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_workers() {
        let cancel = CancellationToken::new();
        let tasks = ["us", "eu"]
            .into_iter()
            .map(|target| {
                ReplicationTask::new(target, |cancel: CancellationToken| async move {
                    cancel.sleep(Duration::from_secs(3600)).await?;
                    Ok::<(), BuildError>(())
                })
            })
            .collect();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel("interrupt");
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Replicator::default().run_all(&cancel, tasks),
        )
        .await
        .expect("fan-out did not stop");

        assert_eq!(result.failed.len(), 2);
        assert!(result.failed.values().all(BuildError::is_cancelled));
    }

    #[tokio::test]
    async fn test_duplicate_target_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let tasks = (0..2)
            .map(|_| {
                let runs = Arc::clone(&runs);
                ReplicationTask::new("us", move |_cancel| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), BuildError>(())
                })
            })
            .collect();

        let result = Replicator::default()
            .run_all(&CancellationToken::new(), tasks)
            .await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempted(), 1);
    }
}
