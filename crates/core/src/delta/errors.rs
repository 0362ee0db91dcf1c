//! Errors raised while running a sync pass

use calsync_domain::{CalSyncError, SourceError, SourceKind};
use thiserror::Error;

/// Failure of one (source, calendar) pass
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] CalSyncError),

    /// The provider rejected the cursor again right after a reset
    #[error("{kind} rejected a full resync of calendar {calendar_id}")]
    ResyncRejected { kind: SourceKind, calendar_id: String },

    #[error("pass cancelled before it started")]
    Cancelled,
}

impl SyncError {
    /// Transient failures are retried with backoff
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Source(err) => err.is_transient(),
            Self::Store(_) | Self::ResyncRejected { .. } | Self::Cancelled => false,
        }
    }

    pub const fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Source(SourceError::AuthExpired(_)))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
