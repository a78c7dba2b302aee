//! Error types for reconcile-rs.
//!
//! [`Error`] is the crate-level error surfaced at startup. Errors that occur
//! inside a reconcile cycle never escape the loop: they are carried by
//! [`ReconcileOutcome`](crate::model::ReconcileOutcome) as [`StoreError`] or
//! [`StrategyError`] and turned into requeues.

use std::time::Duration;

use thiserror::Error;

use crate::model::ResourceKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("metrics error: {0}")]
    Metrics(#[from] crate::telemetry::metrics::MetricsError),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("watch stream closed")]
    WatchClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a [`ResourceStore`](crate::store::ResourceStore).
///
/// "Object absent" on read is not an error: `get` returns `Ok(None)`.
/// [`StoreError::NotFound`] only appears for writes against a missing key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("resource {0} not found")]
    NotFound(ResourceKey),

    #[error("resource {0} already exists")]
    AlreadyExists(ResourceKey),

    #[error("conflict on {key}: expected generation {expected}, found {actual}")]
    Conflict {
        key: ResourceKey,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store call cancelled")]
    Cancelled,
}

impl StoreError {
    /// Optimistic-concurrency failure: a concurrent writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// The pluggable business logic failed to compute a status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StrategyError {
    message: String,
}

impl StrategyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
