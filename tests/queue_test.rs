//! Integration tests for the work queue.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{HoldingStrategy, key, recorder};
use reconcile_rs::engine::{Dispatcher, ReconcileEngine};
use reconcile_rs::model::ResourceSpec;
use reconcile_rs::queue::{BackoffPolicy, WorkQueue};
use reconcile_rs::store::InMemoryStore;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Per-identity exclusion
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_reconcile_per_identity_at_a_time() {
    let store = Arc::new(InMemoryStore::new());
    for name in ["a", "b", "c"] {
        store
            .create(key(name), ResourceSpec::new().field("id", name))
            .unwrap();
    }
    let strategy = HoldingStrategy::new(Duration::from_millis(20));
    let engine = Arc::new(ReconcileEngine::new(store.clone(), strategy.clone(), recorder()));
    let queue = WorkQueue::new();
    let dispatcher = Dispatcher::new(queue.clone(), engine, 4, None);
    let mut workers = dispatcher.spawn(CancellationToken::new());

    let adders: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    for name in ["a", "b", "c"] {
                        queue.add(key(name));
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for adder in adders {
        adder.await.unwrap();
    }
    // Keys may be mid-flight here; the drain must still run them once more.
    let last_add = std::time::Instant::now();
    for name in ["a", "b", "c"] {
        queue.add(key(name));
    }
    queue.shutdown_with_drain();
    while workers.join_next().await.is_some() {}

    assert_eq!(strategy.max_overlap(), 1, "identity reconciled concurrently");
    assert!(strategy.calls() >= 3);
    assert!(queue.is_empty());
    for name in ["a", "b", "c"] {
        assert!(
            strategy.started_after(name, last_add),
            "{name} not reconciled after its last add"
        );
        assert!(store.get_now(&key(name)).unwrap().status.ready);
    }
}

#[tokio::test]
async fn drain_reconciles_a_key_changed_while_in_flight() {
    let queue = WorkQueue::new();
    queue.add(key("a"));
    let lease = queue.lease().await.unwrap();

    queue.add(key("a"));
    queue.shutdown_with_drain();
    queue.add(key("b"));
    drop(lease);

    let again = queue.get().await.unwrap();
    assert_eq!(again.key, key("a"));
    queue.done(&again.key);
    assert!(queue.get().await.is_none(), "adds after the drain must be refused");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_workers_stay_until_a_draining_key_is_released() {
    let queue = WorkQueue::new();
    queue.add(key("a"));
    let lease = queue.lease().await.unwrap();
    queue.add(key("a"));
    queue.shutdown_with_drain();

    let idle = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.get().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!idle.is_finished(), "worker left while a follow-up run was owed");

    drop(lease);
    let request = tokio::time::timeout(Duration::from_secs(5), idle)
        .await
        .expect("idle worker never woke")
        .unwrap()
        .unwrap();
    assert_eq!(request.key, key("a"));
    queue.done(&request.key);
    assert!(queue.get().await.is_none());
}

#[tokio::test]
async fn add_during_processing_yields_exactly_one_more_pass() {
    let queue = WorkQueue::new();
    queue.add(key("a"));

    let lease = queue.lease().await.unwrap();
    for _ in 0..5 {
        queue.add(key("a"));
    }
    assert!(queue.is_empty());
    drop(lease);

    assert_eq!(queue.len(), 1);
    let again = queue.get().await.unwrap();
    assert_eq!(again.key, key("a"));
    queue.done(&again.key);
    assert!(queue.is_empty());
}

// ---------------------------------------------------------------------------
// Delayed adds
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn add_after_fires_after_delay() {
    let queue = WorkQueue::new();
    queue.add_after(key("a"), Duration::from_millis(100));
    assert!(queue.is_empty());
    assert_eq!(queue.pending_delayed(), 1);

    tokio::time::sleep(Duration::from_millis(99)).await;
    assert!(queue.is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.pending_delayed(), 0);
}

#[tokio::test(start_paused = true)]
async fn immediate_add_supersedes_pending_delay() {
    let queue = WorkQueue::new();
    queue.add_after(key("a"), Duration::from_secs(5));
    queue.add(key("a"));
    assert_eq!(queue.pending_delayed(), 0);

    let request = queue.get().await.unwrap();
    queue.done(&request.key);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(queue.is_empty(), "superseded delayed add must not fire");
}

#[tokio::test(start_paused = true)]
async fn earliest_delayed_add_wins() {
    let queue = WorkQueue::new();
    queue.add_after(key("a"), Duration::from_secs(5));
    queue.add_after(key("a"), Duration::from_secs(1));
    queue.add_after(key("a"), Duration::from_secs(3));
    assert_eq!(queue.pending_delayed(), 1);

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(queue.len(), 1);

    let request = queue.get().await.unwrap();
    queue.done(&request.key);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_delays_double_until_forgotten() {
    let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(35));
    let queue = WorkQueue::with_backoff(policy);

    let delays: Vec<_> = (0..4).map(|_| queue.add_rate_limited(key("a"))).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(35),
            Duration::from_millis(35),
        ]
    );
    assert_eq!(queue.num_requeues(&key("a")), 4);

    queue.forget(&key("a"));
    assert_eq!(queue.num_requeues(&key("a")), 0);
    assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(10));
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_wakes_blocked_getters() {
    let queue = WorkQueue::new();
    let getters: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        })
        .collect();

    tokio::task::yield_now().await;
    queue.shutdown();

    for getter in getters {
        assert!(getter.await.unwrap().is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_pending_delayed_adds() {
    let queue = WorkQueue::new();
    queue.add(key("a"));
    queue.add_after(key("b"), Duration::from_millis(10));
    queue.shutdown();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(queue.is_empty());
    assert!(queue.get().await.is_none());
}
