//! In-memory resource store.
//!
//! Single source of truth for resource specs and statuses when no external
//! backend is wired in. Every mutation bumps the resource version and fans a
//! [`ChangeEvent`] out to all live watchers while the lock is held, so
//! watchers observe changes in commit order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{ResourceStore, WatchStream};
use crate::error::StoreError;
use crate::event::{ChangeEvent, ChangeKind};
use crate::manifest::ResourceManifest;
use crate::model::{Resource, ResourceKey, ResourceSpec, ResourceStatus};

/// Store backend. Owns all objects and the watcher list.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceKey, Resource>,
    watchers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.last_version = self.last_version.saturating_add(1);
        self.last_version
    }

    fn emit(&mut self, event: ChangeEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a resource at generation 1 with a default (not ready) status.
    pub fn create(&self, key: ResourceKey, spec: ResourceSpec) -> Result<Resource, StoreError> {
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        let version = inner.next_version();
        let resource = Resource {
            key: key.clone(),
            uid: Uuid::new_v4(),
            generation: 1,
            resource_version: version,
            created_at: Utc::now(),
            spec,
            status: ResourceStatus::default(),
        };
        inner.objects.insert(key.clone(), resource.clone());
        inner.emit(ChangeEvent::new(key, ChangeKind::Added, version));
        Ok(resource)
    }

    /// Replace the spec. Bumps the generation only if the spec actually
    /// changed; an identical spec is a no-op and emits nothing.
    pub fn update_spec(
        &self,
        key: &ResourceKey,
        spec: ResourceSpec,
    ) -> Result<Resource, StoreError> {
        let mut inner = self.lock();
        let current = inner
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if current.spec == spec {
            return Ok(current.clone());
        }

        let version = inner.next_version();
        let updated = {
            let Some(resource) = inner.objects.get_mut(key) else {
                return Err(StoreError::NotFound(key.clone()));
            };
            resource.spec = spec;
            resource.generation = resource.generation.saturating_add(1);
            resource.resource_version = version;
            resource.clone()
        };
        inner.emit(ChangeEvent::new(key.clone(), ChangeKind::Modified, version));
        Ok(updated)
    }

    /// Flip `spec.reconcileTrigger` to force another change notification.
    pub fn toggle_reconcile_trigger(&self, key: &ResourceKey) -> Result<Resource, StoreError> {
        let mut spec = self
            .get_now(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?
            .spec;
        spec.toggle_trigger();
        self.update_spec(key, spec)
    }

    /// Remove a resource and notify watchers.
    pub fn delete(&self, key: &ResourceKey) -> Result<Resource, StoreError> {
        let mut inner = self.lock();
        let removed = inner
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let version = inner.next_version();
        inner.emit(ChangeEvent::new(key.clone(), ChangeKind::Deleted, version));
        Ok(removed)
    }

    /// Synchronous snapshot of one object.
    pub fn get_now(&self, key: &ResourceKey) -> Option<Resource> {
        self.lock().objects.get(key).cloned()
    }

    /// All objects in key order.
    pub fn list(&self) -> Vec<Resource> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create every manifest. Stops at the first failure.
    pub fn seed(&self, manifests: &[ResourceManifest]) -> Result<usize, StoreError> {
        for manifest in manifests {
            self.create(manifest.key.clone(), manifest.spec.clone())?;
        }
        debug!(count = manifests.len(), "store seeded from manifests");
        Ok(manifests.len())
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError> {
        Ok(self.get_now(key))
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        expected_generation: u64,
        status: ResourceStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let actual = inner
            .objects
            .get(key)
            .map(|r| r.generation)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if actual != expected_generation {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected_generation,
                actual,
            });
        }

        let version = inner.next_version();
        if let Some(resource) = inner.objects.get_mut(key) {
            resource.status = status;
            resource.resource_version = version;
        }
        inner.emit(ChangeEvent::new(
            key.clone(),
            ChangeKind::StatusUpdated,
            version,
        ));
        Ok(())
    }

    /// Replays every existing object as `Added`, then streams live changes.
    async fn watch(&self) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for resource in inner.objects.values() {
            let event = ChangeEvent::new(
                resource.key.clone(),
                ChangeKind::Added,
                resource.resource_version,
            );
            // Receiver is alive in this scope.
            let _ = tx.send(event);
        }
        inner.watchers.push(tx);
        Ok(rx)
    }
}
