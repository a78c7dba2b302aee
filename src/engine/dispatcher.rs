//! Worker pool: pull identities off the queue, reconcile, decide requeue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};

use crate::model::{ReconcileOutcome, ReconcileState, ResourceKey};
use crate::queue::WorkQueue;
use crate::telemetry::reconcile::record_state_transition;

use super::reconciler::ReconcileEngine;

/// What happened to one dequeued identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub key: ResourceKey,
    pub outcome: ReconcileOutcome,
    /// Delay before the identity comes back, or `None` if it was not requeued.
    pub requeue_after: Option<Duration>,
}

/// Runs `workers` loops against one queue and one engine.
#[derive(Clone)]
pub struct Dispatcher {
    queue: WorkQueue,
    engine: Arc<ReconcileEngine>,
    workers: usize,
    conflict_delay: Option<Duration>,
}

impl Dispatcher {
    /// `conflict_delay` of `None` sends conflicts through the regular backoff.
    pub fn new(
        queue: WorkQueue,
        engine: Arc<ReconcileEngine>,
        workers: usize,
        conflict_delay: Option<Duration>,
    ) -> Self {
        Self {
            queue,
            engine,
            workers: workers.max(1),
            conflict_delay,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Spawn the worker loops. Each exits when the queue is shut down.
    ///
    /// `cancel` is handed to every reconcile call; cancelling it aborts
    /// in-flight work but does not stop the loops.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for id in 0..self.workers {
            let worker = self.clone();
            let cancel = cancel.clone();
            set.spawn(
                async move { worker.run_worker(cancel).await }
                    .instrument(tracing::info_span!("worker", "worker.id" = id)),
            );
        }
        set
    }

    async fn run_worker(self, cancel: CancellationToken) {
        debug!("worker started");
        let mut handled: u64 = 0;
        while self.process_next(&cancel).await.is_some() {
            handled += 1;
        }
        debug!(handled, "worker stopped, queue shut down");
    }

    /// Take one identity, reconcile it, and requeue according to the outcome.
    ///
    /// Returns `None` once the queue is shut down. The identity is released
    /// before returning, whatever the outcome.
    pub async fn process_next(&self, cancel: &CancellationToken) -> Option<Processed> {
        let lease = self.queue.lease().await?;
        let key = lease.key().clone();
        let span = tracing::debug_span!("dispatch", resource = %key);
        record_state_transition(&span, ReconcileState::Queued, ReconcileState::Processing);

        let waited = Utc::now() - lease.request().enqueued_at;
        span.in_scope(|| debug!(queue_wait_ms = waited.num_milliseconds(), "dequeued"));

        let outcome = self.engine.reconcile(&key, cancel).await;

        let requeue_after = self.requeue(&key, &outcome, &span);
        drop(lease);

        Some(Processed {
            key,
            outcome,
            requeue_after,
        })
    }

    fn requeue(
        &self,
        key: &ResourceKey,
        outcome: &ReconcileOutcome,
        span: &tracing::Span,
    ) -> Option<Duration> {
        if !outcome.is_error() {
            self.queue.forget(key);
            record_state_transition(span, ReconcileState::Processing, ReconcileState::Succeeded);
            record_state_transition(span, ReconcileState::Succeeded, ReconcileState::Idle);
            return None;
        }

        record_state_transition(span, ReconcileState::Processing, ReconcileState::Failed);
        record_state_transition(span, ReconcileState::Failed, ReconcileState::BackoffWait);

        let delay = match self.conflict_delay {
            Some(delay) if outcome.is_conflict() => {
                self.queue.add_after(key.clone(), delay);
                delay
            }
            _ => self.queue.add_rate_limited(key.clone()),
        };
        span.in_scope(|| {
            debug!(
                delay_ms = delay.as_millis() as u64,
                requeues = self.queue.num_requeues(key),
                "requeued"
            )
        });
        Some(delay)
    }
}
