//! In-memory implementations of the core persistence ports

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use calsync_core::{CursorRepository, EventRepository, OperationRepository};
use calsync_domain::{
    CalSyncError, OperationStatus, QueuedOperation, Result as DomainResult, SourceKind,
    SyncCursor, SyncStatus, UnifiedEvent,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Event table keyed by logical id.
///
/// Enforces the same uniqueness of owner identities the SQLite schema does.
#[derive(Default)]
pub struct MemoryEventRepository {
    events: Mutex<BTreeMap<String, UnifiedEvent>>,
}

impl MemoryEventRepository {
    pub async fn all(&self) -> Vec<UnifiedEvent> {
        self.events.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

fn sorted(mut events: Vec<UnifiedEvent>) -> Vec<UnifiedEvent> {
    events.sort_by(|a, b| a.payload.start_time.cmp(&b.payload.start_time));
    events
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn get(&self, logical_id: &str) -> DomainResult<Option<UnifiedEvent>> {
        Ok(self.events.lock().await.get(logical_id).cloned())
    }

    async fn find_by_source_ref(
        &self,
        source: SourceKind,
        remote_id: &str,
    ) -> DomainResult<Option<UnifiedEvent>> {
        Ok(self
            .events
            .lock()
            .await
            .values()
            .find(|event| event.references(source, remote_id))
            .cloned())
    }

    async fn find_by_start_time(&self, start: DateTime<Utc>) -> DomainResult<Vec<UnifiedEvent>> {
        Ok(self
            .events
            .lock()
            .await
            .values()
            .filter(|event| event.payload.start_time == start)
            .cloned()
            .collect())
    }

    async fn upsert(&self, event: &UnifiedEvent) -> DomainResult<()> {
        let mut events = self.events.lock().await;
        if let Some(remote_id) = event.remote_id.as_deref() {
            let clash = events.values().any(|other| {
                other.logical_id != event.logical_id
                    && other.source_kind == event.source_kind
                    && other.remote_id.as_deref() == Some(remote_id)
            });
            if clash {
                return Err(CalSyncError::Database(format!(
                    "UNIQUE constraint failed: {}:{remote_id}",
                    event.source_kind
                )));
            }
        }
        events.insert(event.logical_id.clone(), event.clone());
        Ok(())
    }

    async fn delete(&self, logical_id: &str) -> DomainResult<bool> {
        Ok(self.events.lock().await.remove(logical_id).is_some())
    }

    async fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<UnifiedEvent>> {
        let events = self.events.lock().await;
        Ok(sorted(events.values().filter(|e| e.payload.overlaps(start, end)).cloned().collect()))
    }

    async fn for_calendar(&self, calendar_id: &str) -> DomainResult<Vec<UnifiedEvent>> {
        let events = self.events.lock().await;
        Ok(sorted(events.values().filter(|e| e.calendar_id == calendar_id).cloned().collect()))
    }

    async fn by_status(&self, status: SyncStatus) -> DomainResult<Vec<UnifiedEvent>> {
        let events = self.events.lock().await;
        Ok(sorted(events.values().filter(|e| e.sync_status == status).cloned().collect()))
    }

    async fn for_source_calendar(
        &self,
        source: SourceKind,
        calendar_id: &str,
    ) -> DomainResult<Vec<UnifiedEvent>> {
        let events = self.events.lock().await;
        Ok(sorted(
            events
                .values()
                .filter(|event| {
                    (event.source_kind == source && event.calendar_id == calendar_id)
                        || event.source_refs.iter().any(|reference| {
                            reference.source == source && reference.calendar_id == calendar_id
                        })
                })
                .cloned()
                .collect(),
        ))
    }
}

#[derive(Default)]
struct OperationTable {
    next_sequence: i64,
    rows: Vec<QueuedOperation>,
}

/// Operation table ordered by insertion sequence
#[derive(Default)]
pub struct MemoryOperationRepository {
    table: Mutex<OperationTable>,
}

impl MemoryOperationRepository {
    pub async fn all(&self) -> Vec<QueuedOperation> {
        self.table.lock().await.rows.clone()
    }
}

const fn is_active(operation: &QueuedOperation) -> bool {
    matches!(operation.status, OperationStatus::Pending | OperationStatus::InFlight)
}

#[async_trait]
impl OperationRepository for MemoryOperationRepository {
    async fn insert(&self, operation: &QueuedOperation) -> DomainResult<QueuedOperation> {
        let mut table = self.table.lock().await;
        table.next_sequence += 1;
        let mut stored = operation.clone();
        stored.sequence = table.next_sequence;
        table.rows.push(stored.clone());
        Ok(stored)
    }

    async fn get(&self, operation_id: &str) -> DomainResult<Option<QueuedOperation>> {
        let table = self.table.lock().await;
        Ok(table.rows.iter().find(|row| row.operation_id == operation_id).cloned())
    }

    async fn update(&self, operation: &QueuedOperation) -> DomainResult<()> {
        let mut table = self.table.lock().await;
        let row = table
            .rows
            .iter_mut()
            .find(|row| row.operation_id == operation.operation_id)
            .ok_or_else(|| CalSyncError::NotFound(operation.operation_id.clone()))?;
        let sequence = row.sequence;
        *row = operation.clone();
        row.sequence = sequence;
        Ok(())
    }

    async fn delete(&self, operation_id: &str) -> DomainResult<bool> {
        let mut table = self.table.lock().await;
        let before = table.rows.len();
        table.rows.retain(|row| row.operation_id != operation_id);
        Ok(table.rows.len() != before)
    }

    async fn delete_pending_for(&self, logical_id: &str) -> DomainResult<usize> {
        let mut table = self.table.lock().await;
        let before = table.rows.len();
        table.rows.retain(|row| {
            !(row.target_logical_id == logical_id && row.status == OperationStatus::Pending)
        });
        Ok(before - table.rows.len())
    }

    async fn list_active(&self) -> DomainResult<Vec<QueuedOperation>> {
        let table = self.table.lock().await;
        Ok(table.rows.iter().filter(|row| is_active(row)).cloned().collect())
    }

    async fn list_by_status(&self, status: OperationStatus) -> DomainResult<Vec<QueuedOperation>> {
        let table = self.table.lock().await;
        Ok(table.rows.iter().filter(|row| row.status == status).cloned().collect())
    }

    async fn for_record(&self, logical_id: &str) -> DomainResult<Vec<QueuedOperation>> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .iter()
            .filter(|row| row.target_logical_id == logical_id && is_active(row))
            .cloned()
            .collect())
    }

    async fn count_active(&self) -> DomainResult<usize> {
        Ok(self.table.lock().await.rows.iter().filter(|row| is_active(row)).count())
    }

    async fn reset_in_flight(&self) -> DomainResult<usize> {
        let mut table = self.table.lock().await;
        let mut reset = 0;
        for row in table.rows.iter_mut().filter(|row| row.status == OperationStatus::InFlight) {
            row.status = OperationStatus::Pending;
            reset += 1;
        }
        Ok(reset)
    }
}

/// Cursor table keyed by (source, calendar)
#[derive(Default)]
pub struct MemoryCursorRepository {
    cursors: Mutex<HashMap<(SourceKind, String), SyncCursor>>,
}

#[async_trait]
impl CursorRepository for MemoryCursorRepository {
    async fn get(&self, source: SourceKind, calendar_id: &str) -> DomainResult<Option<SyncCursor>> {
        Ok(self.cursors.lock().await.get(&(source, calendar_id.to_string())).cloned())
    }

    async fn save(&self, cursor: &SyncCursor) -> DomainResult<()> {
        self.cursors
            .lock()
            .await
            .insert((cursor.source, cursor.calendar_id.clone()), cursor.clone());
        Ok(())
    }
}
