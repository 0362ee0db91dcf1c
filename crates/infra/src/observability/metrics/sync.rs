//! Counters for sync passes and queued deliveries
//!
//! ## Design
//! - **VecDeque ring buffer** for pass durations (bounded, O(1) eviction)
//! - **Relaxed ordering** for independent counters, **SeqCst** for the pass
//!   counters that feed the success rate
//! - **MetricsResult returns** so recording sites stay uniform

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::observability::{MetricsError, MetricsResult};

const MAX_DURATION_SAMPLES: usize = 256;

/// Engine-wide sync and delivery counters
#[derive(Debug)]
pub struct SyncMetrics {
    passes_started: AtomicU64,
    passes_succeeded: AtomicU64,
    passes_failed: AtomicU64,
    changes_merged: AtomicU64,
    conflicts_detected: AtomicU64,
    cursor_resets: AtomicU64,
    operations_delivered: AtomicU64,
    operations_retried: AtomicU64,
    operations_abandoned: AtomicU64,
    pass_durations_ms: Mutex<VecDeque<u64>>,
}

/// Point-in-time copy of [`SyncMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    pub passes_started: u64,
    pub passes_succeeded: u64,
    pub passes_failed: u64,
    pub changes_merged: u64,
    pub conflicts_detected: u64,
    pub cursor_resets: u64,
    pub operations_delivered: u64,
    pub operations_retried: u64,
    pub operations_abandoned: u64,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            passes_started: AtomicU64::new(0),
            passes_succeeded: AtomicU64::new(0),
            passes_failed: AtomicU64::new(0),
            changes_merged: AtomicU64::new(0),
            conflicts_detected: AtomicU64::new(0),
            cursor_resets: AtomicU64::new(0),
            operations_delivered: AtomicU64::new(0),
            operations_retried: AtomicU64::new(0),
            operations_abandoned: AtomicU64::new(0),
            pass_durations_ms: Mutex::new(VecDeque::with_capacity(MAX_DURATION_SAMPLES)),
        }
    }

    pub fn record_pass_started(&self) -> MetricsResult<()> {
        self.passes_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Record a merged pass together with its wall time
    pub fn record_pass_succeeded(&self, changes: usize, duration: Duration) -> MetricsResult<()> {
        self.passes_succeeded.fetch_add(1, Ordering::SeqCst);
        self.changes_merged.fetch_add(u64::try_from(changes).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.record_pass_duration(duration)
    }

    pub fn record_pass_failed(&self) -> MetricsResult<()> {
        self.passes_failed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn record_conflicts(&self, count: usize) -> MetricsResult<()> {
        self.conflicts_detected.fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
        Ok(())
    }

    pub fn record_cursor_reset(&self) -> MetricsResult<()> {
        self.cursor_resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_operation_delivered(&self) -> MetricsResult<()> {
        self.operations_delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_operation_retried(&self) -> MetricsResult<()> {
        self.operations_retried.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_operation_abandoned(&self) -> MetricsResult<()> {
        self.operations_abandoned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn record_pass_duration(&self, duration: Duration) -> MetricsResult<()> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let mut samples = self.pass_durations_ms.lock();
        samples.push_back(ms);
        if samples.len() > MAX_DURATION_SAMPLES {
            samples.pop_front();
        }
        Ok(())
    }

    /// Share of finished passes that succeeded
    pub fn pass_success_rate(&self) -> MetricsResult<f64> {
        let succeeded = self.passes_succeeded.load(Ordering::SeqCst);
        let failed = self.passes_failed.load(Ordering::SeqCst);
        let finished = succeeded + failed;
        if finished == 0 {
            return Err(MetricsError::EmptyData { metric: "pass_success_rate" });
        }
        #[allow(clippy::cast_precision_loss)]
        Ok(succeeded as f64 / finished as f64)
    }

    /// Mean duration of the most recent successful passes
    pub fn average_pass_duration(&self) -> MetricsResult<Duration> {
        let samples = self.pass_durations_ms.lock();
        if samples.is_empty() {
            return Err(MetricsError::EmptyData { metric: "average_pass_duration" });
        }
        let total: u64 = samples.iter().sum();
        let count = u64::try_from(samples.len()).unwrap_or(u64::MAX);
        Ok(Duration::from_millis(total / count))
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            passes_started: self.passes_started.load(Ordering::SeqCst),
            passes_succeeded: self.passes_succeeded.load(Ordering::SeqCst),
            passes_failed: self.passes_failed.load(Ordering::SeqCst),
            changes_merged: self.changes_merged.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            cursor_resets: self.cursor_resets.load(Ordering::Relaxed),
            operations_delivered: self.operations_delivered.load(Ordering::Relaxed),
            operations_retried: self.operations_retried.load(Ordering::Relaxed),
            operations_abandoned: self.operations_abandoned.load(Ordering::Relaxed),
        }
    }
}
