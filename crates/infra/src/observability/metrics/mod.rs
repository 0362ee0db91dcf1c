//! Metrics collection modules
//!
//! Thread-safe counters for the sync engine.

pub mod sync;

pub use sync::{SyncMetrics, SyncMetricsSnapshot};
