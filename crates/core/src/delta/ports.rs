//! Port interfaces for cursor persistence

use async_trait::async_trait;
use calsync_domain::{Result, SourceKind, SyncCursor};

/// Durable per-(source, calendar) cursor table
#[async_trait]
pub trait CursorRepository: Send + Sync {
    async fn get(&self, source: SourceKind, calendar_id: &str) -> Result<Option<SyncCursor>>;

    /// Insert or replace the cursor row
    async fn save(&self, cursor: &SyncCursor) -> Result<()>;
}
