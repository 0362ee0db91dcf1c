//! Port interfaces for unified event persistence

use async_trait::async_trait;
use calsync_domain::{Result, SourceKind, SyncStatus, UnifiedEvent};
use chrono::{DateTime, Utc};

/// Durable table of canonical event records
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Fetch a record by logical id
    async fn get(&self, logical_id: &str) -> Result<Option<UnifiedEvent>>;

    /// Resolve a provider identity through the owner columns or the alias
    /// index
    async fn find_by_source_ref(
        &self,
        source: SourceKind,
        remote_id: &str,
    ) -> Result<Option<UnifiedEvent>>;

    /// Records starting exactly at `start`, used for cross-source dedup
    async fn find_by_start_time(&self, start: DateTime<Utc>) -> Result<Vec<UnifiedEvent>>;

    /// Insert or replace a record together with its aliases
    async fn upsert(&self, event: &UnifiedEvent) -> Result<()>;

    /// Remove a record; returns false when it did not exist
    async fn delete(&self, logical_id: &str) -> Result<bool>;

    /// Records intersecting `[start, end)`, ordered by start time
    async fn in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<UnifiedEvent>>;

    /// Records belonging to a calendar, ordered by start time
    async fn for_calendar(&self, calendar_id: &str) -> Result<Vec<UnifiedEvent>>;

    /// Records in the given status
    async fn by_status(&self, status: SyncStatus) -> Result<Vec<UnifiedEvent>>;

    /// Records owned by or aliased to a (source, calendar) pair
    async fn for_source_calendar(
        &self,
        source: SourceKind,
        calendar_id: &str,
    ) -> Result<Vec<UnifiedEvent>>;
}
