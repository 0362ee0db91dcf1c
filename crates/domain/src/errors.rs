//! Error types used throughout the sync engine

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for CalSync
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum CalSyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for CalSync operations
pub type Result<T> = std::result::Result<T, CalSyncError>;

/// Categories of source errors for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceErrorCategory {
    /// Connectivity problems and timeouts - retry with backoff
    Transient,
    /// Provider throttling - retry with a longer backoff
    RateLimit,
    /// Credentials expired - surfaced, blocks the source until re-auth
    Authentication,
    /// Remote version moved underneath a local write - routed to conflict detection
    Conflict,
    /// Remote record is gone
    NotFound,
    /// Malformed payload or refused write - abandoned immediately
    Permanent,
    /// Delta cursor expired - triggers a full resync
    Cursor,
}

/// Typed outcome of a failed source adapter call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String, retry_after: Option<Duration> },

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Remote record not found: {0}")]
    NotFound(String),

    #[error("Permanently rejected: {0}")]
    PermanentRejection(String),

    #[error("Sync cursor invalid: {0}")]
    CursorInvalid(String),
}

impl SourceError {
    /// Get the error category for this error
    pub const fn category(&self) -> SourceErrorCategory {
        match self {
            Self::NetworkUnreachable(_) | Self::Timeout(_) => SourceErrorCategory::Transient,
            Self::RateLimited { .. } => SourceErrorCategory::RateLimit,
            Self::AuthExpired(_) => SourceErrorCategory::Authentication,
            Self::VersionConflict(_) => SourceErrorCategory::Conflict,
            Self::NotFound(_) => SourceErrorCategory::NotFound,
            Self::PermanentRejection(_) => SourceErrorCategory::Permanent,
            Self::CursorInvalid(_) => SourceErrorCategory::Cursor,
        }
    }

    /// Check if this error should be retried by the backoff machinery
    pub const fn is_transient(&self) -> bool {
        matches!(self.category(), SourceErrorCategory::Transient | SourceErrorCategory::RateLimit)
    }

    /// Provider-specified delay, when the provider sent one
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<SourceError> for CalSyncError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(message) => Self::NotFound(message),
            SourceError::PermanentRejection(message) => Self::InvalidInput(message),
            other => Self::Source(other.to_string()),
        }
    }
}
