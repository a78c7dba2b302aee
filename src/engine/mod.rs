//! Reconcile engine, worker pool, and the controller that wires them to a store.

pub mod controller;
pub mod dispatcher;
pub mod reconciler;

pub use controller::{Controller, ControllerConfig, ShutdownMode};
pub use dispatcher::{Dispatcher, Processed};
pub use reconciler::{MarkReady, ReconcileEngine, ReconcileStrategy};
