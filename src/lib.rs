//! # reconcile-rs
//!
//! Level-triggered reconciliation loop for declarative resources.
//!
//! Change notifications become keys on a deduplicating [`queue::WorkQueue`].
//! A pool of workers ([`engine::Dispatcher`]) pulls keys, re-reads the current
//! object, asks a [`engine::ReconcileStrategy`] for the next status, and writes
//! it back with optimistic concurrency. Failures are retried with per-key
//! exponential backoff, and every attempt is counted in Prometheus metrics.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod manifest;
pub mod model;
pub mod queue;
pub mod server;
pub mod store;
pub mod telemetry;
