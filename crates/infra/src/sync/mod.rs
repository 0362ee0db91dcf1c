//! Sync runtime
//!
//! - [`SyncOrchestrator`]: runs delta passes per source and calendar,
//!   coalesces concurrent triggers and publishes per-source state
//! - [`QueueWorker`]: delivers queued local mutations with backoff
//! - [`ReachabilityMonitor`]: connectivity state shared by both
//!
//! Passes and deliveries share one bounded pool of worker slots.

pub mod orchestrator;
pub mod queue_worker;
pub mod reachability;

pub use orchestrator::{OrchestratorConfig, OrchestratorContext, SyncOrchestrator};
pub use queue_worker::{DrainReport, QueueWorker, QueueWorkerConfig, QueueWorkerContext};
pub use reachability::ReachabilityMonitor;
