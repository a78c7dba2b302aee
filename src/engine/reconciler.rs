//! Reconcile engine: fetch, compute, conditionally write, classify.
//!
//! The engine never trusts anything queued with the key. Every call re-reads
//! the object, so a stale or duplicated request is harmless, and every status
//! write is conditioned on the generation that was read in the same call.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{StoreError, StrategyError};
use crate::model::{ReconcileOutcome, ResourceKey, ResourceSpec, ResourceStatus};
use crate::store::ResourceStore;
use crate::telemetry::metrics::MetricsRecorder;
use crate::telemetry::reconcile::{record_result, start_reconcile_span};

/// Business logic: compute the next status from the desired spec and the
/// current status. Must be idempotent.
#[async_trait]
pub trait ReconcileStrategy: Send + Sync {
    async fn compute_status(
        &self,
        spec: &ResourceSpec,
        current: &ResourceStatus,
    ) -> Result<ResourceStatus, StrategyError>;
}

/// Marks every resource ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkReady;

#[async_trait]
impl ReconcileStrategy for MarkReady {
    async fn compute_status(
        &self,
        _spec: &ResourceSpec,
        current: &ResourceStatus,
    ) -> Result<ResourceStatus, StrategyError> {
        Ok(ResourceStatus {
            ready: true,
            ..current.clone()
        })
    }
}

/// Runs one reconcile per call and records metrics for it.
pub struct ReconcileEngine {
    store: Arc<dyn ResourceStore>,
    strategy: Arc<dyn ReconcileStrategy>,
    metrics: Arc<MetricsRecorder>,
    call_timeout: Option<Duration>,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        strategy: Arc<dyn ReconcileStrategy>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            strategy,
            metrics,
            call_timeout: None,
        }
    }

    /// Bound each store call (and the strategy) by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Reconcile `key` once.
    ///
    /// Never fails: every failure is classified into the returned outcome,
    /// and a panic in the strategy or store becomes a strategy error.
    /// Cancelling `cancel` aborts whichever step is running and yields the
    /// error outcome for that step.
    pub async fn reconcile(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> ReconcileOutcome {
        let span = start_reconcile_span(self.metrics.controller(), key);

        async {
            let start = Instant::now();
            self.metrics.reconcile_started();

            let outcome = match AssertUnwindSafe(self.run(key, cancel)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(panic = %message, "reconcile panicked");
                    ReconcileOutcome::StrategyError(StrategyError::new(format!(
                        "reconcile panicked: {message}"
                    )))
                }
            };

            let elapsed = start.elapsed();
            self.metrics.reconcile_finished(&outcome, elapsed);
            record_result(&span, outcome.result_label());

            match &outcome {
                ReconcileOutcome::Success => {
                    info!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        "successfully reconciled resource"
                    );
                }
                ReconcileOutcome::NotFound => info!("resource not found, ignoring"),
                failed => warn!(error = %failed, "reconcile failed"),
            }
            outcome
        }
        .instrument(span.clone())
        .await
    }

    async fn run(&self, key: &ResourceKey, cancel: &CancellationToken) -> ReconcileOutcome {
        let resource = match bounded(self.store.get(key), cancel, self.call_timeout).await {
            Ok(Some(resource)) => resource,
            Ok(None) => return ReconcileOutcome::NotFound,
            Err(e) => return ReconcileOutcome::RetrievalError(e),
        };

        debug!(
            generation = resource.generation,
            resource_version = resource.resource_version,
            ready = resource.status.ready,
            "reconciling"
        );

        let computed = bounded(
            async {
                Ok::<_, StoreError>(
                    self.strategy
                        .compute_status(&resource.spec, &resource.status)
                        .await,
                )
            },
            cancel,
            self.call_timeout,
        )
        .await;
        let mut status = match computed {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return ReconcileOutcome::StrategyError(e),
            Err(e) => {
                return ReconcileOutcome::StrategyError(StrategyError::new(e.to_string()));
            }
        };
        status.observed_generation = Some(resource.generation);

        if status == resource.status {
            debug!("status already converged, skipping write");
            return ReconcileOutcome::Success;
        }

        debug!(ready = status.ready, "updating resource status");
        match bounded(
            self.store.update_status(key, resource.generation, status),
            cancel,
            self.call_timeout,
        )
        .await
        {
            Ok(()) => ReconcileOutcome::Success,
            Err(e) => ReconcileOutcome::StatusUpdateError(e),
        }
    }
}

/// Run a store call under the caller's cancellation token and an optional timeout.
async fn bounded<T, F>(
    call: F,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let limited = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(limit)),
            },
            None => call.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        result = limited => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceSpec;
    use crate::store::InMemoryStore;

    fn engine(store: Arc<InMemoryStore>) -> ReconcileEngine {
        let metrics = Arc::new(MetricsRecorder::new("test").unwrap());
        ReconcileEngine::new(store, Arc::new(MarkReady), metrics)
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn mark_ready_keeps_other_fields() {
        let current = ResourceStatus {
            ready: false,
            observed_generation: Some(4),
        };
        let next = MarkReady
            .compute_status(&ResourceSpec::new(), &current)
            .await
            .unwrap();
        assert!(next.ready);
        assert_eq!(next.observed_generation, Some(4));
    }

    #[tokio::test]
    async fn stamps_observed_generation() {
        let store = Arc::new(InMemoryStore::new());
        let key = ResourceKey::new("default", "r1").unwrap();
        store.create(key.clone(), ResourceSpec::new()).unwrap();
        store.toggle_reconcile_trigger(&key).unwrap();

        let outcome = engine(store.clone())
            .reconcile(&key, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ReconcileOutcome::Success);

        let status = store.get_now(&key).unwrap().status;
        assert!(status.ready);
        assert_eq!(status.observed_generation, Some(2));
    }

    #[tokio::test]
    async fn cancelled_token_yields_retrieval_error() {
        let store = Arc::new(InMemoryStore::new());
        let key = ResourceKey::new("default", "r1").unwrap();
        store.create(key.clone(), ResourceSpec::new()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine(store.clone()).reconcile(&key, &cancel).await;
        assert_eq!(outcome, ReconcileOutcome::RetrievalError(StoreError::Cancelled));
        assert!(!store.get_now(&key).unwrap().status.ready);
    }
}
