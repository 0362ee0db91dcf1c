//! SQLite implementation of the sync cursor table.

use std::sync::Arc;

use async_trait::async_trait;
use calsync_core::CursorRepository;
use calsync_domain::{Result, SourceKind, SyncCursor};
use rusqlite::{params, OptionalExtension, Row};

use super::manager::{map_sql_error, DbManager};
use super::support::{opt_from_millis, opt_to_millis, parse_text, with_connection};

/// SQLite-backed cursor repository.
pub struct SqliteCursorRepository {
    db: Arc<DbManager>,
}

impl SqliteCursorRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CursorRepository for SqliteCursorRepository {
    async fn get(&self, source: SourceKind, calendar_id: &str) -> Result<Option<SyncCursor>> {
        let calendar_id = calendar_id.to_string();
        with_connection(&self.db, move |conn| {
            conn.query_row(SELECT_CURSOR_SQL, params![source.to_string(), calendar_id], map_cursor_row)
                .optional()
                .map_err(map_sql_error)
        })
        .await
    }

    async fn save(&self, cursor: &SyncCursor) -> Result<()> {
        let cursor = cursor.clone();
        with_connection(&self.db, move |conn| {
            conn.execute(
                UPSERT_CURSOR_SQL,
                params![
                    cursor.source.to_string(),
                    cursor.calendar_id,
                    cursor.token,
                    opt_to_millis(cursor.last_successful_sync_at),
                    cursor.invalidation_count,
                ],
            )
            .map(|_| ())
            .map_err(map_sql_error)
        })
        .await
    }
}

const SELECT_CURSOR_SQL: &str = "SELECT source_kind, calendar_id, token, last_successful_sync_at, invalidation_count
    FROM sync_cursors
    WHERE source_kind = ?1 AND calendar_id = ?2";

const UPSERT_CURSOR_SQL: &str = "INSERT INTO sync_cursors (
        source_kind, calendar_id, token, last_successful_sync_at, invalidation_count
    ) VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(source_kind, calendar_id) DO UPDATE SET
        token = excluded.token,
        last_successful_sync_at = excluded.last_successful_sync_at,
        invalidation_count = excluded.invalidation_count";

fn map_cursor_row(row: &Row<'_>) -> rusqlite::Result<SyncCursor> {
    let source_raw: String = row.get(0)?;
    Ok(SyncCursor {
        source: parse_text(0, &source_raw)?,
        calendar_id: row.get(1)?,
        token: row.get(2)?,
        last_successful_sync_at: opt_from_millis(3, row.get(3)?)?,
        invalidation_count: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, SqliteCursorRepository) {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db = DbManager::new(temp_dir.path().join("cursors.db"), 2).expect("manager created");
        db.run_migrations().expect("migrations run");
        (temp_dir, SqliteCursorRepository::new(Arc::new(db)))
    }

    #[tokio::test]
    async fn missing_cursor_reads_as_none() {
        let (_dir, repo) = setup();
        assert!(repo.get(SourceKind::Google, "primary").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_per_source_and_calendar() {
        let (_dir, repo) = setup();
        let mut cursor = SyncCursor::empty(SourceKind::Google, "primary");
        cursor.token = Some("t1".into());
        cursor.last_successful_sync_at = Some(Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap());
        repo.save(&cursor).await.unwrap();

        cursor.token = None;
        cursor.invalidation_count = 2;
        repo.save(&cursor).await.unwrap();

        let mut other = SyncCursor::empty(SourceKind::Microsoft, "primary");
        other.token = Some("ms".into());
        repo.save(&other).await.unwrap();

        assert_eq!(repo.get(SourceKind::Google, "primary").await.unwrap(), Some(cursor));
        assert_eq!(repo.get(SourceKind::Microsoft, "primary").await.unwrap(), Some(other));
    }
}
