//! Delta sync coordinator
//!
//! Wraps an adapter's incremental fetch with cursor bookkeeping. The
//! coordinator is the only writer of the cursor table, and it never moves a
//! cursor forward on its own: the orchestrator calls
//! [`DeltaSyncCoordinator::commit_cursor`] once every page of a pass has
//! been merged.

use std::sync::Arc;
use std::time::Duration;

use calsync_common::Clock;
use calsync_domain::{ChangePage, SourceError, SourceKind, SyncCursor};
use tracing::{debug, instrument, warn};

use super::errors::SyncResult;
use super::ports::CursorRepository;
use crate::sources::SourceAdapter;

/// Outcome of one fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaFetch {
    Page(ChangePage),
    /// The provider rejected the cursor; it has been cleared and the next
    /// fetch must start from scratch
    FullResyncRequired { invalidation_count: u32 },
}

/// Cursor-aware fetch front end
pub struct DeltaSyncCoordinator {
    cursors: Arc<dyn CursorRepository>,
    clock: Arc<dyn Clock>,
    fetch_timeout: Option<Duration>,
}

impl DeltaSyncCoordinator {
    pub fn new(cursors: Arc<dyn CursorRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { cursors, clock, fetch_timeout: None }
    }

    /// Bound every provider fetch; an expired fetch fails with
    /// [`SourceError::Timeout`] before anything is written.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Persisted cursor, or an empty one requiring a full resync
    pub async fn cursor_for(&self, source: SourceKind, calendar_id: &str) -> SyncResult<SyncCursor> {
        Ok(self
            .cursors
            .get(source, calendar_id)
            .await?
            .unwrap_or_else(|| SyncCursor::empty(source, calendar_id)))
    }

    /// Fetch one page starting at `token`.
    ///
    /// `token` is the persisted cursor for the first page of a pass and the
    /// previous page's continuation for later ones. Nothing is persisted
    /// unless the provider reports the cursor invalid.
    #[instrument(skip(self, adapter, token), fields(source = %adapter.kind(), incremental = token.is_some()))]
    pub async fn fetch_changes(
        &self,
        adapter: &dyn SourceAdapter,
        calendar_id: &str,
        token: Option<&str>,
    ) -> SyncResult<DeltaFetch> {
        let fetched = match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, adapter.fetch_changes(calendar_id, token))
                .await
                .unwrap_or(Err(SourceError::Timeout(limit))),
            None => adapter.fetch_changes(calendar_id, token).await,
        };
        match fetched {
            Ok(page) => {
                debug!(
                    changes = page.changes.len(),
                    has_more = page.has_more,
                    "fetched change page"
                );
                Ok(DeltaFetch::Page(page))
            }
            Err(SourceError::CursorInvalid(reason)) => {
                let invalidation_count =
                    self.invalidate_cursor(adapter.kind(), calendar_id).await?;
                warn!(%reason, invalidation_count, "sync cursor rejected, full resync required");
                Ok(DeltaFetch::FullResyncRequired { invalidation_count })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Persist the cursor reached after a fully merged pass.
    ///
    /// `reset_invalidations` clears the invalidation streak; it is only set
    /// when the pass stayed incremental from start to finish.
    #[instrument(skip(self, token))]
    pub async fn commit_cursor(
        &self,
        source: SourceKind,
        calendar_id: &str,
        token: Option<String>,
        reset_invalidations: bool,
    ) -> SyncResult<SyncCursor> {
        let mut cursor = self.cursor_for(source, calendar_id).await?;
        cursor.token = token;
        cursor.last_successful_sync_at = Some(self.clock.utc_now());
        if reset_invalidations {
            cursor.invalidation_count = 0;
        }
        self.cursors.save(&cursor).await?;
        debug!(has_token = cursor.token.is_some(), "cursor committed");
        Ok(cursor)
    }

    /// Clear the token and bump the invalidation streak, returning it
    pub async fn invalidate_cursor(&self, source: SourceKind, calendar_id: &str) -> SyncResult<u32> {
        let mut cursor = self.cursor_for(source, calendar_id).await?;
        cursor.token = None;
        cursor.invalidation_count = cursor.invalidation_count.saturating_add(1);
        self.cursors.save(&cursor).await?;
        Ok(cursor.invalidation_count)
    }
}

impl std::fmt::Debug for DeltaSyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaSyncCoordinator").finish_non_exhaustive()
    }
}
