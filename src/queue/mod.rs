//! Deduplicating work queue of resource identities.
//!
//! Tracks four sets behind one mutex: `queued` (waiting for a worker),
//! `processing` (held by a worker), `dirty` (notified while processing) and
//! `waiting` (delayed adds). An identity is never in `queued` and
//! `processing` at once, which is what serializes work per identity.

pub mod backoff;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::{ReconcileRequest, ResourceKey};

pub use backoff::BackoffPolicy;
use backoff::FailureTracker;

/// Cloneable handle; all clones share one queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    queue: VecDeque<ResourceKey>,
    queued: HashMap<ResourceKey, DateTime<Utc>>,
    processing: HashSet<ResourceKey>,
    dirty: HashMap<ResourceKey, DateTime<Utc>>,
    waiting: HashMap<ResourceKey, Pending>,
    next_token: u64,
    failures: FailureTracker,
    shutting_down: bool,
    /// Set by [`WorkQueue::shutdown_with_drain`]: dirty identities still get
    /// their follow-up run.
    draining: bool,
}

/// A scheduled delayed add. Only the task holding the current token may fire it.
struct Pending {
    ready_at: Instant,
    token: u64,
}

impl QueueState {
    /// Returns `true` if the key was pushed and a waiter should be woken.
    fn enqueue(&mut self, key: ResourceKey, at: DateTime<Utc>) -> bool {
        if self.processing.contains(&key) {
            self.dirty.entry(key).or_insert(at);
            return false;
        }
        if self.queued.contains_key(&key) {
            return false;
        }
        self.queued.insert(key.clone(), at);
        self.queue.push_back(key);
        true
    }

    /// A drain is finished once nothing is queued and no held identity owes
    /// a follow-up run.
    fn drained(&self) -> bool {
        self.queue.is_empty() && self.dirty.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_backoff(BackoffPolicy::default())
    }

    pub fn with_backoff(policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    queued: HashMap::new(),
                    processing: HashSet::new(),
                    dirty: HashMap::new(),
                    waiting: HashMap::new(),
                    next_token: 0,
                    failures: FailureTracker::new(policy),
                    shutting_down: false,
                    draining: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `key`. Collapses with an existing queued entry, marks the key
    /// dirty if a worker holds it, and supersedes any pending delayed add.
    pub fn add(&self, key: ResourceKey) {
        let pushed = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.waiting.remove(&key);
            state.enqueue(key, Utc::now())
        };
        if pushed {
            self.inner.notify.notify_one();
        }
    }

    /// Wait for the next identity and mark it processing. `None` once the
    /// queue is shut down. When draining, `None` only once the queue is empty
    /// and no identity in processing is dirty.
    pub async fn get(&self) -> Option<ReconcileRequest> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    let enqueued_at = state.queued.remove(&key).unwrap_or_else(Utc::now);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(ReconcileRequest { key, enqueued_at });
                }
                if state.shutting_down && (!state.draining || state.drained()) {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// [`get`](Self::get) wrapped in a guard that calls [`done`](Self::done)
    /// when dropped, including on unwind.
    pub async fn lease(&self) -> Option<Lease> {
        let request = self.get().await?;
        Some(Lease {
            queue: self.clone(),
            request,
        })
    }

    /// Release `key`. If it was added while processing, queue it again now,
    /// also while draining.
    pub fn done(&self, key: &ResourceKey) {
        let (pushed, drained) = {
            let mut state = self.lock();
            state.processing.remove(key);
            let pushed = match state.dirty.remove(key) {
                Some(at) if !state.shutting_down || state.draining => {
                    state.enqueue(key.clone(), at)
                }
                _ => false,
            };
            (pushed, state.draining && state.drained())
        };
        if pushed {
            self.inner.notify.notify_one();
        } else if drained {
            self.inner.notify.notify_waiters();
        }
    }

    /// Add `key` after `delay`. The earliest pending deadline wins, and an
    /// immediate [`add`](Self::add) before the deadline supersedes it.
    pub fn add_after(&self, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;

        let token = {
            let mut state = self.lock();
            if state.shutting_down
                || state.queued.contains_key(&key)
                || state.dirty.contains_key(&key)
            {
                return;
            }
            if state
                .waiting
                .get(&key)
                .is_some_and(|pending| pending.ready_at <= ready_at)
            {
                return;
            }
            state.next_token = state.next_token.wrapping_add(1);
            let token = state.next_token;
            state.waiting.insert(key.clone(), Pending { ready_at, token });
            token
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::downgrade(&self.inner);
                handle.spawn(async move {
                    tokio::time::sleep_until(ready_at).await;
                    if let Some(inner) = shared.upgrade() {
                        WorkQueue { inner }.fire(key, token);
                    }
                });
            }
            Err(_) => {
                warn!(%key, ?delay, "no async runtime for delayed add, adding immediately");
                self.fire(key, token);
            }
        }
    }

    fn fire(&self, key: ResourceKey, token: u64) {
        let pushed = {
            let mut state = self.lock();
            let current = state
                .waiting
                .get(&key)
                .is_some_and(|pending| pending.token == token);
            if current {
                state.waiting.remove(&key);
                !state.shutting_down && state.enqueue(key, Utc::now())
            } else {
                false
            }
        };
        if pushed {
            self.inner.notify.notify_one();
        }
    }

    /// `add_after` with the backoff policy's next delay for `key`.
    pub fn add_rate_limited(&self, key: ResourceKey) -> Duration {
        let delay = self.lock().failures.when(&key);
        debug!(%key, ?delay, "requeue with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure counter for `key`.
    pub fn forget(&self, key: &ResourceKey) {
        self.lock().failures.forget(key);
    }

    /// Consecutive failures recorded for `key` since the last `forget`.
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.lock().failures.num_requeues(key)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.lock().failures.policy()
    }

    /// Stop accepting work, drop everything queued or delayed, and wake all
    /// blocked `get` callers.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.draining = false;
            state.queue.clear();
            state.queued.clear();
            state.dirty.clear();
            state.waiting.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Stop accepting work but keep handing out what is already queued,
    /// including the follow-up run of identities made dirty while processing.
    /// Delayed adds are dropped.
    pub fn shutdown_with_drain(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down && !state.draining {
                return;
            }
            state.shutting_down = true;
            state.draining = true;
            state.waiting.clear();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Identities waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &ResourceKey) -> bool {
        self.lock().processing.contains(key)
    }

    /// Delayed adds that have not fired yet.
    pub fn pending_delayed(&self) -> usize {
        self.lock().waiting.len()
    }
}

/// A dequeued identity. Dropping it marks the identity done.
pub struct Lease {
    queue: WorkQueue,
    request: ReconcileRequest,
}

impl Lease {
    pub fn key(&self) -> &ResourceKey {
        &self.request.key
    }

    pub fn request(&self) -> &ReconcileRequest {
        &self.request
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.queue.done(&self.request.key);
    }
}
