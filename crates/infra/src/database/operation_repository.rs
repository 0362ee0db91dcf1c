//! SQLite implementation of the offline queue's operation table.
//!
//! The autoincrement `sequence` column is the queue order. Rows are never
//! renumbered, so an operation keeps its place across retries and restarts.

use std::sync::Arc;

use async_trait::async_trait;
use calsync_core::OperationRepository;
use calsync_domain::{CalSyncError, OperationStatus, QueuedOperation, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::warn;

use super::manager::{map_sql_error, DbManager};
use super::support::{
    from_millis, opt_from_json, opt_from_millis, opt_to_json, opt_to_millis, parse_text,
    to_millis, with_connection,
};

/// SQLite-backed operation repository.
pub struct SqliteOperationRepository {
    db: Arc<DbManager>,
}

impl SqliteOperationRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn query(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<QueuedOperation>> {
        let mut stmt = conn.prepare_cached(sql).map_err(map_sql_error)?;
        let rows = stmt
            .query_map(params, map_operation_row)
            .map_err(map_sql_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_error);
        rows
    }
}

#[async_trait]
impl OperationRepository for SqliteOperationRepository {
    async fn insert(&self, operation: &QueuedOperation) -> Result<QueuedOperation> {
        let mut stored = operation.clone();
        with_connection(&self.db, move |conn| {
            let payload_json = opt_to_json(stored.payload.as_ref())?;
            let source_kind = stored.source.to_string();
            let kind = stored.kind.to_string();
            let status = stored.status.to_string();
            let next_retry_at = opt_to_millis(stored.next_retry_at);
            let created_at = to_millis(stored.created_at);

            let params: [&dyn ToSql; 12] = [
                &stored.operation_id,
                &stored.target_logical_id,
                &source_kind,
                &stored.calendar_id,
                &kind,
                &payload_json,
                &stored.remote_id,
                &stored.attempt_count,
                &next_retry_at,
                &status,
                &stored.last_error,
                &created_at,
            ];
            conn.execute(INSERT_OPERATION_SQL, params.as_slice()).map_err(map_sql_error)?;
            stored.sequence = conn.last_insert_rowid();
            Ok(stored)
        })
        .await
    }

    async fn get(&self, operation_id: &str) -> Result<Option<QueuedOperation>> {
        let operation_id = operation_id.to_string();
        with_connection(&self.db, move |conn| {
            let sql = format!("{SELECT_OPERATION_SQL} WHERE operation_id = ?1");
            conn.query_row(&sql, params![operation_id], map_operation_row)
                .optional()
                .map_err(map_sql_error)
        })
        .await
    }

    async fn update(&self, operation: &QueuedOperation) -> Result<()> {
        let operation = operation.clone();
        with_connection(&self.db, move |conn| {
            let updated = conn
                .execute(
                    UPDATE_OPERATION_SQL,
                    params![
                        operation.operation_id,
                        operation.status.to_string(),
                        operation.attempt_count,
                        opt_to_millis(operation.next_retry_at),
                        operation.last_error,
                        operation.remote_id,
                    ],
                )
                .map_err(map_sql_error)?;
            if updated == 0 {
                return Err(CalSyncError::NotFound(format!("operation {}", operation.operation_id)));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, operation_id: &str) -> Result<bool> {
        let operation_id = operation_id.to_string();
        with_connection(&self.db, move |conn| {
            conn.execute("DELETE FROM queued_operations WHERE operation_id = ?1", params![operation_id])
                .map(|removed| removed > 0)
                .map_err(map_sql_error)
        })
        .await
    }

    async fn delete_pending_for(&self, logical_id: &str) -> Result<usize> {
        let logical_id = logical_id.to_string();
        with_connection(&self.db, move |conn| {
            conn.execute(
                "DELETE FROM queued_operations WHERE target_logical_id = ?1 AND status = 'pending'",
                params![logical_id],
            )
            .map_err(map_sql_error)
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<QueuedOperation>> {
        with_connection(&self.db, |conn| {
            let sql = format!("{SELECT_OPERATION_SQL} WHERE {ACTIVE_FILTER} ORDER BY sequence");
            Self::query(conn, &sql, &[])
        })
        .await
    }

    async fn list_by_status(&self, status: OperationStatus) -> Result<Vec<QueuedOperation>> {
        with_connection(&self.db, move |conn| {
            let sql = format!("{SELECT_OPERATION_SQL} WHERE status = ?1 ORDER BY sequence");
            Self::query(conn, &sql, &[&status.to_string()])
        })
        .await
    }

    async fn for_record(&self, logical_id: &str) -> Result<Vec<QueuedOperation>> {
        let logical_id = logical_id.to_string();
        with_connection(&self.db, move |conn| {
            let sql = format!(
                "{SELECT_OPERATION_SQL} WHERE target_logical_id = ?1 AND {ACTIVE_FILTER} ORDER BY sequence"
            );
            Self::query(conn, &sql, &[&logical_id])
        })
        .await
    }

    async fn count_active(&self) -> Result<usize> {
        with_connection(&self.db, |conn| {
            let sql = format!("SELECT COUNT(*) FROM queued_operations WHERE {ACTIVE_FILTER}");
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).map_err(map_sql_error)?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn reset_in_flight(&self) -> Result<usize> {
        with_connection(&self.db, |conn| {
            conn.execute(
                "UPDATE queued_operations SET status = 'pending' WHERE status = 'in_flight'",
                [],
            )
            .map_err(map_sql_error)
        })
        .await
    }
}

const ACTIVE_FILTER: &str = "status IN ('pending', 'in_flight')";

const SELECT_OPERATION_SQL: &str = "SELECT
        sequence, operation_id, target_logical_id, source_kind, calendar_id, kind, payload_json,
        remote_id, attempt_count, next_retry_at, status, last_error, created_at
    FROM queued_operations";

const INSERT_OPERATION_SQL: &str = "INSERT INTO queued_operations (
        operation_id, target_logical_id, source_kind, calendar_id, kind, payload_json, remote_id,
        attempt_count, next_retry_at, status, last_error, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const UPDATE_OPERATION_SQL: &str = "UPDATE queued_operations SET
        status = ?2,
        attempt_count = ?3,
        next_retry_at = ?4,
        last_error = ?5,
        remote_id = ?6
    WHERE operation_id = ?1";

fn map_operation_row(row: &Row<'_>) -> rusqlite::Result<QueuedOperation> {
    let operation_id: String = row.get(1)?;
    let source_raw: String = row.get(3)?;
    let kind_raw: String = row.get(5)?;
    let status_raw: String = row.get(10)?;
    let status = parse_status(&operation_id, &status_raw);

    Ok(QueuedOperation {
        sequence: row.get(0)?,
        target_logical_id: row.get(2)?,
        source: parse_text(3, &source_raw)?,
        calendar_id: row.get(4)?,
        kind: parse_text(5, &kind_raw)?,
        payload: opt_from_json(6, row.get(6)?)?,
        remote_id: row.get(7)?,
        attempt_count: row.get(8)?,
        next_retry_at: opt_from_millis(9, row.get(9)?)?,
        status,
        last_error: row.get(11)?,
        created_at: from_millis(12, row.get(12)?)?,
        operation_id,
    })
}

fn parse_status(id: &str, raw: &str) -> OperationStatus {
    match raw.parse::<OperationStatus>() {
        Ok(status) => status,
        Err(err) => {
            warn!(
                operation_id = %id,
                raw_status = %raw,
                error = %err,
                "invalid operation status stored, defaulting to pending"
            );
            OperationStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use calsync_domain::{EventPayload, OperationKind, SourceKind};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, SqliteOperationRepository) {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db = DbManager::new(temp_dir.path().join("queue.db"), 2).expect("manager created");
        db.run_migrations().expect("migrations run");
        (temp_dir, SqliteOperationRepository::new(Arc::new(db)))
    }

    fn operation(logical_id: &str, kind: OperationKind) -> QueuedOperation {
        let now = Utc.with_ymd_and_hms(2025, 5, 12, 8, 0, 0).unwrap();
        let payload = (kind != OperationKind::Delete)
            .then(|| EventPayload::new("Retro", now + Duration::hours(2), None));
        QueuedOperation::new(logical_id, SourceKind::Google, "primary", kind, payload, None, now)
    }

    #[tokio::test]
    async fn insert_assigns_increasing_sequence() {
        let (_dir, repo) = setup();
        let first = repo.insert(&operation("local:1", OperationKind::Create)).await.unwrap();
        let second = repo.insert(&operation("local:2", OperationKind::Create)).await.unwrap();

        assert!(first.sequence > 0);
        assert!(second.sequence > first.sequence);
        assert_eq!(repo.get(&first.operation_id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn update_persists_mutable_columns() {
        let (_dir, repo) = setup();
        let mut stored = repo.insert(&operation("local:1", OperationKind::Update)).await.unwrap();
        stored.status = OperationStatus::Pending;
        stored.attempt_count = 3;
        stored.next_retry_at = Some(stored.created_at + Duration::seconds(8));
        stored.set_error("network unreachable");
        stored.remote_id = Some("g-1".into());
        repo.update(&stored).await.unwrap();

        assert_eq!(repo.get(&stored.operation_id).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let (_dir, repo) = setup();
        let err = repo.update(&operation("local:1", OperationKind::Delete)).await.unwrap_err();
        assert!(matches!(err, CalSyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn active_listing_and_counts_skip_abandoned() {
        let (_dir, repo) = setup();
        let create = repo.insert(&operation("local:1", OperationKind::Create)).await.unwrap();
        let mut update = repo.insert(&operation("local:1", OperationKind::Update)).await.unwrap();
        let mut other = repo.insert(&operation("local:2", OperationKind::Delete)).await.unwrap();
        update.status = OperationStatus::InFlight;
        repo.update(&update).await.unwrap();
        other.status = OperationStatus::Abandoned;
        repo.update(&other).await.unwrap();

        let active: Vec<_> =
            repo.list_active().await.unwrap().into_iter().map(|op| op.operation_id).collect();
        assert_eq!(active, vec![create.operation_id.clone(), update.operation_id.clone()]);
        assert_eq!(repo.count_active().await.unwrap(), 2);
        assert_eq!(repo.for_record("local:2").await.unwrap().len(), 0);
        assert_eq!(repo.list_by_status(OperationStatus::Abandoned).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_pending_for_leaves_in_flight_rows() {
        let (_dir, repo) = setup();
        let mut in_flight = repo.insert(&operation("local:1", OperationKind::Create)).await.unwrap();
        in_flight.status = OperationStatus::InFlight;
        repo.update(&in_flight).await.unwrap();
        repo.insert(&operation("local:1", OperationKind::Update)).await.unwrap();

        assert_eq!(repo.delete_pending_for("local:1").await.unwrap(), 1);
        let remaining = repo.for_record("local:1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].operation_id, in_flight.operation_id);
    }

    #[tokio::test]
    async fn reset_in_flight_returns_rows_to_pending() {
        let (_dir, repo) = setup();
        let mut stored = repo.insert(&operation("local:1", OperationKind::Create)).await.unwrap();
        stored.status = OperationStatus::InFlight;
        repo.update(&stored).await.unwrap();

        assert_eq!(repo.reset_in_flight().await.unwrap(), 1);
        let reloaded = repo.get(&stored.operation_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, OperationStatus::Pending);
        assert_eq!(reloaded.sequence, stored.sequence);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_existed() {
        let (_dir, repo) = setup();
        let stored = repo.insert(&operation("local:1", OperationKind::Create)).await.unwrap();
        assert!(repo.delete(&stored.operation_id).await.unwrap());
        assert!(!repo.delete(&stored.operation_id).await.unwrap());
    }
}
