//! Reconcile cycle span helpers.

use tracing::Span;

use crate::model::{ReconcileState, ResourceKey};

/// Start a span covering one reconcile call.
///
/// The `reconcile.result` field is declared empty and filled by
/// [`record_result`].
pub fn start_reconcile_span(controller: &str, key: &ResourceKey) -> Span {
    tracing::info_span!(
        "reconcile",
        "reconcile.controller" = controller,
        "resource.namespace" = key.namespace(),
        "resource.name" = key.name(),
        "reconcile.result" = tracing::field::Empty,
    )
}

/// Fill in the result label on a reconcile span.
pub fn record_result(span: &Span, result: &str) {
    span.record("reconcile.result", result);
}

/// Emit a per-identity state transition event scoped to `span`.
pub fn record_state_transition(span: &Span, from: ReconcileState, to: ReconcileState) {
    span.in_scope(|| {
        if from.can_transition_to(to) {
            tracing::debug!(%from, %to, "state_transition");
        } else {
            tracing::warn!(%from, %to, "unexpected state_transition");
        }
    });
}
