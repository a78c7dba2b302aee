//! Resource identity and the persisted resource object.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Namespace sentinel for cluster-scoped resources.
pub const CLUSTER_SCOPE: &str = "<cluster>";

/// Namespace used when a manifest or CLI argument omits one.
pub const DEFAULT_NAMESPACE: &str = "default";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Namespace + name. The unit of deduplication and per-key serialization.
///
/// Ordering is namespace first, then name. Deserialization goes through
/// [`ResourceKey::new`], so a decoded key is always valid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawKey")]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    /// Build a namespaced key. Both parts must be non-empty and free of `/`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("name", &name)?;
        Ok(Self { namespace, name })
    }

    /// Build a key for a resource that lives outside any namespace.
    pub fn cluster_scoped(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment("name", &name)?;
        Ok(Self {
            namespace: CLUSTER_SCOPE.to_string(),
            name,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace == CLUSTER_SCOPE
    }
}

#[derive(Deserialize)]
struct RawKey {
    namespace: String,
    name: String,
}

impl TryFrom<RawKey> for ResourceKey {
    type Error = Error;

    fn try_from(raw: RawKey) -> Result<Self> {
        Self::new(raw.namespace, raw.name)
    }
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidKey(format!("{what} must not be empty")));
    }
    if value.contains('/') {
        return Err(Error::InvalidKey(format!(
            "{what} must not contain '/': {value}"
        )));
    }
    Ok(())
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cluster_scoped() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    /// `namespace/name`, or a bare `name` for cluster-scoped resources.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::cluster_scoped(s),
        }
    }
}

// ---------------------------------------------------------------------------
// Spec / Status
// ---------------------------------------------------------------------------

/// Desired state. Opaque to the loop apart from `reconcileTrigger`, which
/// exists only so callers can force a new change notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_trigger: Option<bool>,

    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ResourceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn reconcile_trigger(mut self, trigger: bool) -> Self {
        self.reconcile_trigger = Some(trigger);
        self
    }

    /// Flip `reconcileTrigger`. An unset trigger becomes `true`.
    pub fn toggle_trigger(&mut self) {
        self.reconcile_trigger = Some(!self.reconcile_trigger.unwrap_or(false));
    }
}

/// Observed state. Written only through the conditional status path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Defaults to `false` until the first successful reconcile.
    #[serde(default)]
    pub ready: bool,

    /// Generation the status was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A versioned resource as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(rename = "metadata")]
    pub key: ResourceKey,

    pub uid: Uuid,

    /// Bumped on spec changes only.
    pub generation: u64,

    /// Bumped on every write, spec or status.
    pub resource_version: u64,

    pub created_at: DateTime<Utc>,

    pub spec: ResourceSpec,

    #[serde(default)]
    pub status: ResourceStatus,
}
