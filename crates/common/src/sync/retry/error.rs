// Error types for retry module
use std::time::Duration;

use thiserror::Error;

/// Errors raised while building a retry policy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("max_attempts must be between {min} and {max}, got {actual}")]
    InvalidAttempts { min: u32, max: u32, actual: u32 },

    #[error("base_delay ({base:?}) cannot be greater than max_delay ({max:?})")]
    InvalidDelays { base: Duration, max: Duration },
}

/// Result type for retry operations
pub type RetryResult<T> = Result<T, RetryError>;
