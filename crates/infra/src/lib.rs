//! # CalSync Infrastructure
//!
//! Infrastructure implementations of the core ports and the runtime that
//! drives them.
//!
//! This crate contains:
//! - SQLite repositories for events, cursors and queued operations
//! - The sync orchestrator, offline queue worker and reachability monitor
//! - The periodic scheduler
//! - Configuration loading, logging and metrics
//! - [`CalendarSyncEngine`], the composition root and consumer API
//!
//! ## Architecture
//! - Implements traits defined in `calsync-core`
//! - Contains all "impure" code (I/O, tasks, timers)

pub mod config;
pub mod database;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod scheduling;
pub mod sync;

// Re-export commonly used items
pub use database::{DbManager, SqliteCursorRepository, SqliteEventRepository, SqliteOperationRepository};
pub use engine::{backoff_from_config, CalendarSyncEngine, CalendarSyncEngineBuilder};
pub use errors::InfraError;
pub use observability::logging::init_tracing;
pub use observability::metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use scheduling::{SchedulerError, SyncScheduler, SyncSchedulerConfig};
pub use sync::{DrainReport, QueueWorker, ReachabilityMonitor, SyncOrchestrator};
