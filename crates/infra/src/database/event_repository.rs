//! SQLite implementation of the unified event repository.
//!
//! Payloads are stored as JSON next to denormalised title and time columns
//! used for range and fingerprint lookups. Alias identities live in
//! `event_source_refs` and are rewritten with the record in one transaction.

use std::sync::Arc;

use async_trait::async_trait;
use calsync_core::EventRepository;
use calsync_domain::{Result, SourceKind, SourceRef, SyncStatus, UnifiedEvent};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::warn;

use super::manager::{map_sql_error, DbManager};
use super::support::{
    from_json, opt_from_json, opt_from_millis, opt_to_json, opt_to_millis, parse_text, to_json,
    to_millis, with_connection,
};

/// SQLite-backed event repository.
pub struct SqliteEventRepository {
    db: Arc<DbManager>,
}

impl SqliteEventRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn load_many(
        conn: &Connection,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<UnifiedEvent>> {
        let mut stmt = conn.prepare_cached(sql).map_err(map_sql_error)?;
        let rows = stmt
            .query_map(params, map_event_row)
            .map_err(map_sql_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_error)?;
        rows.into_iter().map(|event| Self::attach_refs(conn, event)).collect()
    }

    fn load_one(conn: &Connection, logical_id: &str) -> Result<Option<UnifiedEvent>> {
        let sql = format!("{SELECT_EVENT_SQL} WHERE logical_id = ?1");
        let event = conn
            .query_row(&sql, params![logical_id], map_event_row)
            .optional()
            .map_err(map_sql_error)?;
        event.map(|event| Self::attach_refs(conn, event)).transpose()
    }

    fn attach_refs(conn: &Connection, mut event: UnifiedEvent) -> Result<UnifiedEvent> {
        let mut stmt = conn.prepare_cached(SELECT_REFS_SQL).map_err(map_sql_error)?;
        event.source_refs = stmt
            .query_map(params![event.logical_id], map_ref_row)
            .map_err(map_sql_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_error)?;
        Ok(event)
    }

    fn write(conn: &mut Connection, event: &UnifiedEvent) -> Result<()> {
        let payload_json = to_json(&event.payload)?;
        let base_json = opt_to_json(event.base_payload.as_ref())?;
        let conflict_json = opt_to_json(event.conflict.as_ref())?;
        let source_kind = event.source_kind.to_string();
        let sync_status = event.sync_status.to_string();
        let start_time = to_millis(event.payload.start_time);
        let end_time = to_millis(event.payload.end_time);
        let last_modified_local = opt_to_millis(event.last_modified_local);
        let last_modified_remote = opt_to_millis(event.last_modified_remote);

        let params: [&dyn ToSql; 15] = [
            &event.logical_id,
            &source_kind,
            &event.remote_id,
            &event.calendar_id,
            &event.calendar_name,
            &event.payload.title,
            &start_time,
            &end_time,
            &payload_json,
            &base_json,
            &event.version,
            &sync_status,
            &last_modified_local,
            &last_modified_remote,
            &conflict_json,
        ];

        let tx = conn.transaction().map_err(map_sql_error)?;
        tx.execute(UPSERT_EVENT_SQL, params.as_slice()).map_err(map_sql_error)?;
        tx.execute("DELETE FROM event_source_refs WHERE logical_id = ?1", params![event.logical_id])
            .map_err(map_sql_error)?;
        {
            let mut insert = tx.prepare_cached(INSERT_REF_SQL).map_err(map_sql_error)?;
            for reference in &event.source_refs {
                insert
                    .execute(params![
                        event.logical_id,
                        reference.source.to_string(),
                        reference.calendar_id,
                        reference.remote_id,
                    ])
                    .map_err(map_sql_error)?;
            }
        }
        tx.commit().map_err(map_sql_error)
    }
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn get(&self, logical_id: &str) -> Result<Option<UnifiedEvent>> {
        let logical_id = logical_id.to_string();
        with_connection(&self.db, move |conn| Self::load_one(conn, &logical_id)).await
    }

    async fn find_by_source_ref(
        &self,
        source: SourceKind,
        remote_id: &str,
    ) -> Result<Option<UnifiedEvent>> {
        let remote_id = remote_id.to_string();
        with_connection(&self.db, move |conn| {
            let logical_id: Option<String> = conn
                .query_row(FIND_BY_REF_SQL, params![source.to_string(), remote_id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(map_sql_error)?;
            match logical_id {
                Some(logical_id) => Self::load_one(conn, &logical_id),
                None => Ok(None),
            }
        })
        .await
    }

    async fn find_by_start_time(&self, start: DateTime<Utc>) -> Result<Vec<UnifiedEvent>> {
        with_connection(&self.db, move |conn| {
            let sql = format!("{SELECT_EVENT_SQL} WHERE start_time = ?1 ORDER BY logical_id");
            Self::load_many(conn, &sql, &[&to_millis(start)])
        })
        .await
    }

    async fn upsert(&self, event: &UnifiedEvent) -> Result<()> {
        let event = event.clone();
        with_connection(&self.db, move |conn| Self::write(conn, &event)).await
    }

    async fn delete(&self, logical_id: &str) -> Result<bool> {
        let logical_id = logical_id.to_string();
        with_connection(&self.db, move |conn| {
            conn.execute("DELETE FROM unified_events WHERE logical_id = ?1", params![logical_id])
                .map(|removed| removed > 0)
                .map_err(map_sql_error)
        })
        .await
    }

    async fn in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<UnifiedEvent>> {
        with_connection(&self.db, move |conn| {
            let sql = format!(
                "{SELECT_EVENT_SQL} WHERE start_time < ?2 AND end_time > ?1 ORDER BY start_time, logical_id"
            );
            Self::load_many(conn, &sql, &[&to_millis(start), &to_millis(end)])
        })
        .await
    }

    async fn for_calendar(&self, calendar_id: &str) -> Result<Vec<UnifiedEvent>> {
        let calendar_id = calendar_id.to_string();
        with_connection(&self.db, move |conn| {
            let sql =
                format!("{SELECT_EVENT_SQL} WHERE calendar_id = ?1 ORDER BY start_time, logical_id");
            Self::load_many(conn, &sql, &[&calendar_id])
        })
        .await
    }

    async fn by_status(&self, status: SyncStatus) -> Result<Vec<UnifiedEvent>> {
        with_connection(&self.db, move |conn| {
            let sql =
                format!("{SELECT_EVENT_SQL} WHERE sync_status = ?1 ORDER BY start_time, logical_id");
            Self::load_many(conn, &sql, &[&status.to_string()])
        })
        .await
    }

    async fn for_source_calendar(
        &self,
        source: SourceKind,
        calendar_id: &str,
    ) -> Result<Vec<UnifiedEvent>> {
        let calendar_id = calendar_id.to_string();
        with_connection(&self.db, move |conn| {
            let sql = format!(
                "{SELECT_EVENT_SQL}
                 WHERE (source_kind = ?1 AND calendar_id = ?2)
                    OR logical_id IN (
                        SELECT logical_id FROM event_source_refs
                        WHERE source_kind = ?1 AND calendar_id = ?2
                    )
                 ORDER BY start_time, logical_id"
            );
            Self::load_many(conn, &sql, &[&source.to_string(), &calendar_id])
        })
        .await
    }
}

const SELECT_EVENT_SQL: &str = "SELECT
        logical_id, source_kind, remote_id, calendar_id, calendar_name, payload_json,
        base_payload_json, version, sync_status, last_modified_local, last_modified_remote,
        conflict_json
    FROM unified_events";

const UPSERT_EVENT_SQL: &str = "INSERT INTO unified_events (
        logical_id, source_kind, remote_id, calendar_id, calendar_name, title, start_time,
        end_time, payload_json, base_payload_json, version, sync_status, last_modified_local,
        last_modified_remote, conflict_json
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
    ON CONFLICT(logical_id) DO UPDATE SET
        source_kind = excluded.source_kind,
        remote_id = excluded.remote_id,
        calendar_id = excluded.calendar_id,
        calendar_name = excluded.calendar_name,
        title = excluded.title,
        start_time = excluded.start_time,
        end_time = excluded.end_time,
        payload_json = excluded.payload_json,
        base_payload_json = excluded.base_payload_json,
        version = excluded.version,
        sync_status = excluded.sync_status,
        last_modified_local = excluded.last_modified_local,
        last_modified_remote = excluded.last_modified_remote,
        conflict_json = excluded.conflict_json";

const FIND_BY_REF_SQL: &str = "SELECT logical_id FROM unified_events
        WHERE source_kind = ?1 AND remote_id = ?2
    UNION ALL
    SELECT logical_id FROM event_source_refs
        WHERE source_kind = ?1 AND remote_id = ?2
    LIMIT 1";

const SELECT_REFS_SQL: &str = "SELECT source_kind, calendar_id, remote_id
    FROM event_source_refs
    WHERE logical_id = ?1
    ORDER BY rowid";

const INSERT_REF_SQL: &str = "INSERT INTO event_source_refs (logical_id, source_kind, calendar_id, remote_id)
    VALUES (?1, ?2, ?3, ?4)";

fn map_event_row(row: &Row<'_>) -> rusqlite::Result<UnifiedEvent> {
    let logical_id: String = row.get(0)?;
    let source_raw: String = row.get(1)?;
    let payload_raw: String = row.get(5)?;
    let status_raw: String = row.get(8)?;
    let sync_status = parse_sync_status(&logical_id, &status_raw);

    Ok(UnifiedEvent {
        source_kind: parse_text(1, &source_raw)?,
        remote_id: row.get(2)?,
        calendar_id: row.get(3)?,
        calendar_name: row.get(4)?,
        payload: from_json(5, &payload_raw)?,
        base_payload: opt_from_json(6, row.get(6)?)?,
        version: row.get(7)?,
        sync_status,
        last_modified_local: opt_from_millis(9, row.get(9)?)?,
        last_modified_remote: opt_from_millis(10, row.get(10)?)?,
        conflict: opt_from_json(11, row.get(11)?)?,
        source_refs: Vec::new(),
        logical_id,
    })
}

fn map_ref_row(row: &Row<'_>) -> rusqlite::Result<SourceRef> {
    let source_raw: String = row.get(0)?;
    Ok(SourceRef {
        source: parse_text(0, &source_raw)?,
        calendar_id: row.get(1)?,
        remote_id: row.get(2)?,
    })
}

fn parse_sync_status(logical_id: &str, raw: &str) -> SyncStatus {
    match raw.parse::<SyncStatus>() {
        Ok(status) => status,
        Err(err) => {
            warn!(
                logical_id = %logical_id,
                raw_status = %raw,
                error = %err,
                "invalid sync status stored for event, treating it as failed"
            );
            SyncStatus::Failed
        }
    }
}
