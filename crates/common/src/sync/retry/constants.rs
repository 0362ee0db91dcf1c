// Constants for retry module
use std::time::Duration;

/// Default maximum number of delivery attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Default delay before the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default maximum delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default upper bound (exclusive) of the random jitter added to each delay
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);

/// Maximum exponent for exponential backoff calculation to prevent overflow
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Minimum allowed max_attempts value
pub const MIN_MAX_ATTEMPTS: u32 = 1;

/// Maximum allowed max_attempts value
pub const MAX_MAX_ATTEMPTS: u32 = 100;
