//! Observability for the sync engine: tracing setup and engine counters
//!
//! Metric recording methods return [`MetricsResult`] so callers can log a
//! failed recording and carry on. Recording itself never fails today; only
//! derived values (averages, rates) report [`MetricsError::EmptyData`] when
//! nothing has been recorded yet.
//!
//! ```rust
//! use calsync_infra::observability::metrics::SyncMetrics;
//!
//! let metrics = SyncMetrics::new();
//! if let Err(e) = metrics.record_pass_started() {
//!     tracing::warn!("Failed to record metric: {}", e);
//! }
//! ```

pub mod logging;
pub mod metrics;

/// Metrics error type
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetricsError {
    /// Empty data set - cannot calculate aggregate metric
    #[error("Empty data: cannot calculate {metric}")]
    EmptyData {
        /// Metric name that failed (e.g., "pass_success_rate")
        metric: &'static str,
    },
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Log a failed metric recording without interrupting the caller
pub(crate) fn log_metric(result: MetricsResult<()>, metric: &'static str) {
    if let Err(err) = result {
        tracing::warn!(metric = metric, error = ?err, "Failed to record metric");
    }
}
