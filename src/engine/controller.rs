//! Controller: watch the store, feed the queue, run the workers, shut down.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::event::{ChangeEvent, ChangeKind};
use crate::queue::{BackoffPolicy, WorkQueue};
use crate::store::ResourceStore;
use crate::telemetry::metrics::MetricsRecorder;

use super::dispatcher::Dispatcher;
use super::reconciler::{ReconcileEngine, ReconcileStrategy};

/// Default short retry for optimistic-concurrency conflicts.
pub const DEFAULT_CONFLICT_DELAY: Duration = Duration::from_millis(10);

/// What happens to queued and in-flight work on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Finish everything already queued, let in-flight calls complete.
    #[default]
    Drain,
    /// Drop queued work and cancel in-flight calls.
    Cancel,
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownMode::Drain => write!(f, "drain"),
            ShutdownMode::Cancel => write!(f, "cancel"),
        }
    }
}

impl FromStr for ShutdownMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(ShutdownMode::Drain),
            "cancel" => Ok(ShutdownMode::Cancel),
            other => Err(Error::Config(format!(
                "invalid shutdown mode {other:?}, expected \"drain\" or \"cancel\""
            ))),
        }
    }
}

/// Configuration for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Value of the `controller` metric label and log field.
    pub name: String,
    /// Concurrent reconciles across distinct identities.
    pub workers: usize,
    pub backoff: BackoffPolicy,
    /// Fixed retry delay for conflicts; `None` uses the backoff instead.
    pub conflict_delay: Option<Duration>,
    /// Upper bound on each store call made by a reconcile.
    pub reconcile_timeout: Option<Duration>,
    pub shutdown: ShutdownMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "resource".to_string(),
            workers: 2,
            backoff: BackoffPolicy::default(),
            conflict_delay: Some(DEFAULT_CONFLICT_DELAY),
            reconcile_timeout: None,
            shutdown: ShutdownMode::Drain,
        }
    }
}

/// Level-triggered controller over one [`ResourceStore`].
pub struct Controller {
    store: Arc<dyn ResourceStore>,
    queue: WorkQueue,
    dispatcher: Dispatcher,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        strategy: Arc<dyn ReconcileStrategy>,
        metrics: Arc<MetricsRecorder>,
        config: ControllerConfig,
    ) -> Self {
        let queue = WorkQueue::with_backoff(config.backoff);
        let engine = Arc::new(
            ReconcileEngine::new(Arc::clone(&store), strategy, metrics)
                .with_call_timeout(config.reconcile_timeout),
        );
        let dispatcher = Dispatcher::new(
            queue.clone(),
            engine,
            config.workers,
            config.conflict_delay,
        );
        Self {
            store,
            queue,
            dispatcher,
            config,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Translate one change notification into queue operations.
    ///
    /// A deletion resets the backoff and enqueues the key so the next
    /// reconcile observes the absence. Status-only writes are ignored: they
    /// come from reconciles themselves and leave the desired state unchanged.
    pub fn handle_event(&self, event: ChangeEvent) {
        debug!(
            key = %event.key,
            kind = %event.kind,
            resource_version = event.resource_version,
            "change observed"
        );
        match event.kind {
            ChangeKind::StatusUpdated => return,
            ChangeKind::Deleted => self.queue.forget(&event.key),
            ChangeKind::Added | ChangeKind::Modified => {}
        }
        self.queue.add(event.key);
    }

    /// Run until `shutdown` is cancelled or the watch stream ends.
    ///
    /// # Errors
    ///
    /// Fails if the watch cannot be opened, or with [`Error::WatchClosed`]
    /// if the stream ends before shutdown. Workers are stopped either way.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.store.watch().await?;

        let in_flight = match self.config.shutdown {
            ShutdownMode::Drain => CancellationToken::new(),
            ShutdownMode::Cancel => shutdown.child_token(),
        };
        let mut workers = self.dispatcher.spawn(in_flight.clone());

        info!(
            controller = %self.config.name,
            workers = self.dispatcher.workers(),
            shutdown_mode = %self.config.shutdown,
            "controller started, watching for changes"
        );

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(controller = %self.config.name, "controller shutting down");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        error!(controller = %self.config.name, "watch stream closed");
                        break Err(Error::WatchClosed);
                    }
                },
            }
        };

        match self.config.shutdown {
            ShutdownMode::Drain => self.queue.shutdown_with_drain(),
            ShutdownMode::Cancel => {
                self.queue.shutdown();
                in_flight.cancel();
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker task failed: {e}");
            }
        }

        info!(controller = %self.config.name, "controller stopped");
        result
    }
}
