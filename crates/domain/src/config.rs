//! Configuration management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_CLOCK_SKEW_MS, DEFAULT_CURSOR_INVALID_ALERT_THRESHOLD,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_CONCURRENT_PASSES, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_JITTER_MS, DEFAULT_OPERATION_TIMEOUT, DEFAULT_PASS_TIMEOUT,
    DEFAULT_PUSH_RENEWAL_INTERVAL_SECS, DEFAULT_RATE_LIMIT_DELAY_MS, DEFAULT_SYNC_INTERVAL_SECS,
};
use crate::errors::{CalSyncError, Result};
use crate::types::ResolutionStrategy;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub conflicts: ConflictConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(CalSyncError::Config("database.path must not be empty".into()));
        }
        if self.database.pool_size == 0 {
            return Err(CalSyncError::Config("database.pool_size must be at least 1".into()));
        }
        if self.sync.max_concurrent_passes == 0 {
            return Err(CalSyncError::Config("sync.max_concurrent_passes must be at least 1".into()));
        }
        if self.sync.pass_timeout_seconds == 0 {
            return Err(CalSyncError::Config("sync.pass_timeout_seconds must be at least 1".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(CalSyncError::Config("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.base_delay_ms > self.queue.max_delay_ms {
            return Err(CalSyncError::Config(format!(
                "queue.base_delay_ms ({}) exceeds queue.max_delay_ms ({})",
                self.queue.base_delay_ms, self.queue.max_delay_ms
            )));
        }
        if self.queue.operation_timeout_seconds == 0 {
            return Err(CalSyncError::Config(
                "queue.operation_timeout_seconds must be at least 1".into(),
            ));
        }
        for (name, strategy) in [
            ("conflicts.disjoint_edits", self.conflicts.disjoint_edits),
            ("conflicts.schedule_vs_details", self.conflicts.schedule_vs_details),
        ] {
            if strategy == ResolutionStrategy::KeepLocal || strategy == ResolutionStrategy::KeepRemote
            {
                return Err(CalSyncError::Config(format!(
                    "{name} must be merge, keep_both or defer (got {strategy})"
                )));
            }
        }
        Ok(())
    }
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "calsync.db".to_string(), pool_size: 4 }
    }
}

/// Sync orchestration configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the periodic background sync
    pub enabled: bool,
    pub interval_seconds: u64,
    pub max_concurrent_passes: usize,
    pub pass_timeout_seconds: u64,
    /// Consecutive cursor resets before the user is alerted
    pub cursor_invalid_alert_threshold: u32,
    pub push_renewal_interval_seconds: u64,
}

impl SyncConfig {
    pub const fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_seconds)
    }

    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub const fn push_renewal_interval(&self) -> Duration {
        Duration::from_secs(self.push_renewal_interval_seconds)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: DEFAULT_SYNC_INTERVAL_SECS,
            max_concurrent_passes: DEFAULT_MAX_CONCURRENT_PASSES,
            pass_timeout_seconds: DEFAULT_PASS_TIMEOUT.as_secs(),
            cursor_invalid_alert_threshold: DEFAULT_CURSOR_INVALID_ALERT_THRESHOLD,
            push_renewal_interval_seconds: DEFAULT_PUSH_RENEWAL_INTERVAL_SECS,
        }
    }
}

/// Offline queue retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
    /// Floor applied when a provider throttles without a retry hint
    pub rate_limit_delay_ms: u64,
    pub operation_timeout_seconds: u64,
}

impl QueueConfig {
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub const fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_jitter_ms: DEFAULT_MAX_JITTER_MS,
            rate_limit_delay_ms: DEFAULT_RATE_LIMIT_DELAY_MS,
            operation_timeout_seconds: DEFAULT_OPERATION_TIMEOUT.as_secs(),
        }
    }
}

/// Automatic conflict-resolution policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Below this gap last-writer-wins is not trusted and the conflict is deferred
    pub clock_skew_ms: i64,
    /// Both sides edited, no field in common
    pub disjoint_edits: ResolutionStrategy,
    /// One side moved the event, the other edited its details
    pub schedule_vs_details: ResolutionStrategy,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            clock_skew_ms: DEFAULT_CLOCK_SKEW_MS,
            disjoint_edits: ResolutionStrategy::Merge,
            schedule_vs_details: ResolutionStrategy::KeepBoth,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when no env override is set
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}
