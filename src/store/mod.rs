//! Resource store capability consumed by the reconcile loop.
//!
//! The loop never owns resource state. It reads objects, writes status
//! conditionally, and subscribes to change notifications through this
//! trait. [`InMemoryStore`] is the reference implementation.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::event::ChangeEvent;
use crate::model::{Resource, ResourceKey, ResourceStatus};

pub use memory::InMemoryStore;

/// Stream of change notifications. Closed when the store goes away.
pub type WatchStream = mpsc::UnboundedReceiver<ChangeEvent>;

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current object. `Ok(None)` means the key is absent.
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError>;

    /// Replace the status if the stored generation still equals
    /// `expected_generation`; otherwise fail with [`StoreError::Conflict`].
    ///
    /// All-or-nothing: a failed call leaves the stored status untouched.
    async fn update_status(
        &self,
        key: &ResourceKey,
        expected_generation: u64,
        status: ResourceStatus,
    ) -> Result<(), StoreError>;

    /// Subscribe to change notifications.
    async fn watch(&self) -> Result<WatchStream, StoreError>;
}
