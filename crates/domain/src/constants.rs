//! Application constants
//!
//! Centralized location for the domain-level defaults of the sync engine.

use std::time::Duration;

// Event normalisation
pub const DEFAULT_EVENT_DURATION_MINUTES: i64 = 60;
pub const ALL_DAY_EVENT_DURATION_HOURS: i64 = 24;
pub const DEFAULT_CALENDAR_ID: &str = "primary";
pub const UNTITLED_EVENT_TITLE: &str = "Untitled Event";

// Orchestration
pub const DEFAULT_MAX_CONCURRENT_PASSES: usize = 3;
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_CURSOR_INVALID_ALERT_THRESHOLD: u32 = 3;
pub const DEFAULT_PUSH_RENEWAL_INTERVAL_SECS: u64 = 3_600;

// Offline queue retry policy
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;
pub const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_MAX_JITTER_MS: u64 = 1_000;
pub const DEFAULT_RATE_LIMIT_DELAY_MS: u64 = 30_000;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

// Conflict detection
pub const DEFAULT_CLOCK_SKEW_MS: i64 = 2_000;

// Error text persisted alongside operations
pub const MAX_ERROR_LENGTH: usize = 256;
