//! Change notifications emitted by a resource store's watch stream.
//!
//! Events are hints, not instructions: the loop is level-triggered, so an
//! event only says "look at this key again". The kind matters for deletions,
//! which discard the identity's backoff state, and for status-only writes,
//! which never change the desired state and are not reconciled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ResourceKey;

/// A change observed on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    /// Resource version after the change (the last version for deletions).
    pub resource_version: u64,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(key: ResourceKey, kind: ChangeKind, resource_version: u64) -> Self {
        Self {
            key,
            kind,
            resource_version,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    /// Only the status changed; spec and generation are as before.
    StatusUpdated,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::StatusUpdated => "status_updated",
            ChangeKind::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}
