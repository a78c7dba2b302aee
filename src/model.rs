//! Core data model.
//!
//! A resource is identified by namespace + name, carries a desired `spec`
//! and an observed `status`, and is reconciled one identity at a time.
//! The queue only ever carries identities; the engine always re-fetches.

pub mod resource;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StrategyError};

pub use resource::{
    CLUSTER_SCOPE, DEFAULT_NAMESPACE, Resource, ResourceKey, ResourceSpec, ResourceStatus,
};

// ---------------------------------------------------------------------------
// Reconcile Request
// ---------------------------------------------------------------------------

/// The unit of work handed to a worker. No payload beyond identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub key: ResourceKey,

    /// When the identity first entered the queue for this pass. Collapsed
    /// duplicate adds keep the earliest time.
    pub enqueued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reconcile Outcome
// ---------------------------------------------------------------------------

/// Result of one reconcile attempt. Determines requeue policy and metric labels.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Status converged (written, or already equal).
    Success,
    /// Object vanished between enqueue and fetch. Not an error.
    NotFound,
    /// Fetch failed for a reason other than absence.
    RetrievalError(StoreError),
    /// Conditional status write failed, including conflicts.
    StatusUpdateError(StoreError),
    /// The strategy could not compute a status.
    StrategyError(StrategyError),
}

impl ReconcileOutcome {
    /// Value of the `result` label on `controller_reconcile_total`.
    pub fn result_label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Success => "success",
            ReconcileOutcome::NotFound => "not_found",
            _ => "error",
        }
    }

    /// Value of the `error_type` label, or `None` when nothing failed.
    pub fn error_type(&self) -> Option<&'static str> {
        match self {
            ReconcileOutcome::Success | ReconcileOutcome::NotFound => None,
            ReconcileOutcome::RetrievalError(_) => Some("get_resource"),
            ReconcileOutcome::StatusUpdateError(_) => Some("status_update"),
            ReconcileOutcome::StrategyError(_) => Some("strategy"),
        }
    }

    /// Errors are retried with backoff; `Success` and `NotFound` are not.
    pub fn is_error(&self) -> bool {
        self.error_type().is_some()
    }

    /// A status write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileOutcome::StatusUpdateError(e) if e.is_conflict())
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::Success => write!(f, "success"),
            ReconcileOutcome::NotFound => write!(f, "not found"),
            ReconcileOutcome::RetrievalError(e) => write!(f, "failed to get resource: {e}"),
            ReconcileOutcome::StatusUpdateError(e) => write!(f, "failed to update status: {e}"),
            ReconcileOutcome::StrategyError(e) => write!(f, "strategy failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-identity state
// ---------------------------------------------------------------------------

/// Where an identity sits in the reconcile lifecycle.
///
/// Driven by the queue and dispatcher, not by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    /// Nothing pending. Leaves only on a new change notification.
    Idle,
    /// Waiting for a worker.
    Queued,
    /// A worker holds the key.
    Processing,
    /// Last attempt converged.
    Succeeded,
    /// Last attempt failed and will be retried.
    Failed,
    /// Delayed re-add pending.
    BackoffWait,
}

impl ReconcileState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ReconcileState) -> bool {
        use ReconcileState::*;
        matches!(
            (self, to),
            (Idle, Queued)
                | (Queued, Processing)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Succeeded, Idle)
                | (Succeeded, Queued)   // dirty while processing
                | (Failed, BackoffWait)
                | (Failed, Queued)      // dirty while processing
                | (BackoffWait, Queued)
        )
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileState::Idle => "idle",
            ReconcileState::Queued => "queued",
            ReconcileState::Processing => "processing",
            ReconcileState::Succeeded => "succeeded",
            ReconcileState::Failed => "failed",
            ReconcileState::BackoffWait => "backoff_wait",
        };
        write!(f, "{s}")
    }
}
