//! Reconcile metrics on an explicit Prometheus registry.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `controller_reconcile_total` | Counter | `controller`, `result` |
//! | `controller_reconcile_duration_seconds` | Histogram | `controller` |
//! | `controller_reconcile_errors_total` | Counter | `controller`, `error_type` |
//!
//! `result` is one of `started`, `success`, `not_found`, `error`;
//! `error_type` is one of `get_resource`, `status_update`, `strategy`.
//!
//! Recording never fails a reconcile: label or backend errors are logged at
//! debug level and dropped.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::debug;

use crate::model::ReconcileOutcome;

/// `result` label recorded when a reconcile begins.
pub const RESULT_STARTED: &str = "started";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Reconcile metrics for one controller.
///
/// All instruments are lock-free and safe to share across workers.
#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Registry,
    controller: String,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    reconcile_errors: IntCounterVec,
}

impl MetricsRecorder {
    /// Create a recorder with its own registry.
    ///
    /// # Errors
    ///
    /// Fails if a metric cannot be registered.
    pub fn new(controller: impl Into<String>) -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new(), controller)
    }

    /// Register the reconcile metrics on an existing registry.
    ///
    /// # Errors
    ///
    /// Fails if a metric with the same name is already registered.
    pub fn with_registry(
        registry: Registry,
        controller: impl Into<String>,
    ) -> Result<Self, MetricsError> {
        let reconcile_total = IntCounterVec::new(
            Opts::new(
                "controller_reconcile_total",
                "Total number of reconciliation attempts",
            ),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "controller_reconcile_duration_seconds",
                "Time spent reconciling resources",
            ),
            &["controller"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        let reconcile_errors = IntCounterVec::new(
            Opts::new(
                "controller_reconcile_errors_total",
                "Total number of reconciliation errors",
            ),
            &["controller", "error_type"],
        )?;
        registry.register(Box::new(reconcile_errors.clone()))?;

        Ok(Self {
            registry,
            controller: controller.into(),
            reconcile_total,
            reconcile_duration,
            reconcile_errors,
        })
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Count a reconcile attempt as started.
    pub fn reconcile_started(&self) {
        self.inc_total(RESULT_STARTED);
    }

    /// Record how a reconcile ended and how long the whole call took.
    pub fn reconcile_finished(&self, outcome: &ReconcileOutcome, elapsed: Duration) {
        self.inc_total(outcome.result_label());
        if let Some(error_type) = outcome.error_type() {
            match self
                .reconcile_errors
                .get_metric_with_label_values(&[self.controller.as_str(), error_type])
            {
                Ok(counter) => counter.inc(),
                Err(e) => debug!(error_type, "dropping error metric: {e}"),
            }
        }
        match self
            .reconcile_duration
            .get_metric_with_label_values(&[self.controller.as_str()])
        {
            Ok(histogram) => histogram.observe(elapsed.as_secs_f64()),
            Err(e) => debug!("dropping duration metric: {e}"),
        }
    }

    fn inc_total(&self, result: &str) {
        match self
            .reconcile_total
            .get_metric_with_label_values(&[self.controller.as_str(), result])
        {
            Ok(counter) => counter.inc(),
            Err(e) => debug!(result, "dropping reconcile metric: {e}"),
        }
    }

    /// Current value of `controller_reconcile_total{result}`.
    pub fn reconcile_count(&self, result: &str) -> u64 {
        self.reconcile_total
            .get_metric_with_label_values(&[self.controller.as_str(), result])
            .map_or(0, |c| c.get())
    }

    /// Current value of `controller_reconcile_errors_total{error_type}`.
    pub fn error_count(&self, error_type: &str) -> u64 {
        self.reconcile_errors
            .get_metric_with_label_values(&[self.controller.as_str(), error_type])
            .map_or(0, |c| c.get())
    }

    /// Sum of all `controller_reconcile_errors_total` series for this controller.
    pub fn total_errors(&self) -> u64 {
        ["get_resource", "status_update", "strategy"]
            .iter()
            .map(|error_type| self.error_count(error_type))
            .sum()
    }

    /// Number of durations observed.
    pub fn duration_samples(&self) -> u64 {
        self.reconcile_duration
            .get_metric_with_label_values(&[self.controller.as_str()])
            .map_or(0, |h| h.get_sample_count())
    }

    /// Encode every metric in the registry in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Fails if encoding fails or produces invalid UTF-8.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
