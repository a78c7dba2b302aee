//! Shared fixtures: a fault-injecting store wrapper and strategy strategies.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reconcile_rs::error::{StoreError, StrategyError};
use reconcile_rs::model::{Resource, ResourceKey, ResourceSpec, ResourceStatus};
use reconcile_rs::store::{InMemoryStore, ResourceStore, WatchStream};
use reconcile_rs::engine::ReconcileStrategy;
use reconcile_rs::telemetry::metrics::MetricsRecorder;

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::new("default", name).unwrap()
}

pub fn recorder() -> Arc<MetricsRecorder> {
    Arc::new(MetricsRecorder::new("resource").unwrap())
}

// ---------------------------------------------------------------------------
// Fault-injecting store
// ---------------------------------------------------------------------------

/// Wraps an [`InMemoryStore`] and fails scripted calls.
///
/// Scripted failures are consumed in order, one per call.
pub struct FaultyStore {
    inner: Arc<InMemoryStore>,
    get_failures: Mutex<VecDeque<StoreError>>,
    status_failures: Mutex<VecDeque<StoreError>>,
    /// Spec applied to the object just before the next status write lands.
    interleaved_spec: Mutex<Option<ResourceSpec>>,
    gets: AtomicUsize,
    status_writes: AtomicUsize,
    closed_watch: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            get_failures: Mutex::new(VecDeque::new()),
            status_failures: Mutex::new(VecDeque::new()),
            interleaved_spec: Mutex::new(None),
            gets: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
            closed_watch: AtomicBool::new(false),
        })
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn fail_next_get(&self, error: StoreError) {
        self.get_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_status(&self, error: StoreError) {
        self.status_failures.lock().unwrap().push_back(error);
    }

    /// Simulate a concurrent writer: bump the spec right before the next
    /// status write reaches the store.
    pub fn interleave_spec_update(&self, spec: ResourceSpec) {
        *self.interleaved_spec.lock().unwrap() = Some(spec);
    }

    /// Make `watch` hand out a stream that is already closed.
    pub fn close_watch(&self) {
        self.closed_watch.store(true, Ordering::SeqCst);
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Status writes attempted, including failed ones.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for FaultyStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.get_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.inner.get(key).await
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        expected_generation: u64,
        status: ResourceStatus,
    ) -> Result<(), StoreError> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.status_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let interleaved = self.interleaved_spec.lock().unwrap().take();
        if let Some(spec) = interleaved {
            self.inner.update_spec(key, spec)?;
        }
        self.inner.update_status(key, expected_generation, status).await
    }

    async fn watch(&self) -> Result<WatchStream, StoreError> {
        if self.closed_watch.load(Ordering::SeqCst) {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            return Ok(rx);
        }
        self.inner.watch().await
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Marks ready, but holds each call for `hold` and records per-key overlap.
pub struct HoldingStrategy {
    hold: Duration,
    in_flight: Mutex<HashMap<String, usize>>,
    last_started: Mutex<HashMap<String, Instant>>,
    max_overlap: AtomicUsize,
    calls: AtomicUsize,
}

impl HoldingStrategy {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            in_flight: Mutex::new(HashMap::new()),
            last_started: Mutex::new(HashMap::new()),
            max_overlap: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    /// Highest number of simultaneous calls observed for any single spec.
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether a call for spec `id` began after `instant`.
    pub fn started_after(&self, id: &str, instant: Instant) -> bool {
        self.last_started
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|started| *started > instant)
    }
}

#[async_trait]
impl ReconcileStrategy for HoldingStrategy {
    async fn compute_status(
        &self,
        spec: &ResourceSpec,
        current: &ResourceStatus,
    ) -> Result<ResourceStatus, StrategyError> {
        // The spec carries the resource name so overlap is tracked per identity.
        let id = spec
            .fields
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(id.clone()).or_default();
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }
        self.last_started
            .lock()
            .unwrap()
            .insert(id.clone(), Instant::now());
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;

        if let Some(count) = self.in_flight.lock().unwrap().get_mut(&id) {
            *count -= 1;
        }
        Ok(ResourceStatus {
            ready: true,
            ..current.clone()
        })
    }
}

/// Fails the first `failures` calls, then marks ready.
pub struct FlakyStrategy {
    remaining: AtomicUsize,
}

impl FlakyStrategy {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl ReconcileStrategy for FlakyStrategy {
    async fn compute_status(
        &self,
        _spec: &ResourceSpec,
        current: &ResourceStatus,
    ) -> Result<ResourceStatus, StrategyError> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StrategyError::new("dependency not ready"));
        }
        Ok(ResourceStatus {
            ready: true,
            ..current.clone()
        })
    }
}

/// Panics on every call.
pub struct PanickingStrategy;

#[async_trait]
impl ReconcileStrategy for PanickingStrategy {
    async fn compute_status(
        &self,
        _spec: &ResourceSpec,
        _current: &ResourceStatus,
    ) -> Result<ResourceStatus, StrategyError> {
        panic!("strategy exploded");
    }
}
