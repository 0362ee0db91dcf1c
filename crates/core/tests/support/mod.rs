//! Shared test helpers for `calsync-core` integration tests.
//!
//! In-memory repositories behind the core ports plus a scripted source
//! adapter, so store, queue and coordinator behaviour can be exercised
//! without a database.

#![allow(dead_code)]

pub mod adapter;
pub mod repositories;

use std::sync::Arc;

use calsync_common::MockClock;
use calsync_core::{ConflictDetector, OfflineQueue, UnifiedEventStore};
use calsync_domain::EventPayload;
use chrono::{DateTime, TimeZone, Utc};

pub use adapter::ScriptedAdapter;
pub use repositories::{MemoryCursorRepository, MemoryEventRepository, MemoryOperationRepository};

/// Fixed wall-clock anchor for deterministic timestamps
pub fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()
}

/// Timed payload starting `hours` after the anchor
pub fn payload(title: &str, hours: i64) -> EventPayload {
    EventPayload::new(title, anchor() + chrono::Duration::hours(hours), None)
}

/// Store wired to in-memory repositories
pub struct Harness {
    pub clock: MockClock,
    pub events: Arc<MemoryEventRepository>,
    pub operations: Arc<MemoryOperationRepository>,
    pub queue: Arc<OfflineQueue>,
    pub store: UnifiedEventStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_detector(ConflictDetector::default())
    }

    pub fn with_detector(detector: ConflictDetector) -> Self {
        let clock = MockClock::at(anchor());
        let events = Arc::new(MemoryEventRepository::default());
        let operations = Arc::new(MemoryOperationRepository::default());
        let queue = Arc::new(OfflineQueue::new(operations.clone(), Arc::new(clock.clone())));
        let store = UnifiedEventStore::new(
            events.clone(),
            queue.clone(),
            detector,
            Arc::new(clock.clone()),
        );
        Self { clock, events, operations, queue, store }
    }
}
