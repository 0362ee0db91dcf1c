//! Background scheduling
//!
//! The [`SyncScheduler`] triggers periodic sync passes and renews push
//! subscriptions. It follows the same lifecycle rules as the queue worker:
//! explicit start/stop, a tracked join handle, a cancellation token and a
//! bounded join on shutdown.

pub mod error;
pub mod sync_scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use sync_scheduler::{PeriodicSync, SyncScheduler, SyncSchedulerConfig};
