//! # CalSync Core
//!
//! Pure synchronization logic - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port interfaces (traits) for adapters and persistence
//! - Merge planning and cross-source identity resolution
//! - Conflict detection and resolution
//! - The unified event store, delta coordinator and offline queue services
//!
//! ## Architecture Principles
//! - Only depends on `calsync-common` and `calsync-domain`
//! - No database, HTTP, or platform code
//! - All external dependencies via traits

pub mod conflict;
pub mod delta;
pub mod queue;
pub mod sources;
pub mod store;

pub use conflict::{
    ConflictDecision, ConflictDetector, ConflictInput, ConflictPolicy, ConflictResolver,
    Convergence, ResolutionPlan,
};
pub use delta::{CursorRepository, DeltaFetch, DeltaSyncCoordinator, SyncError, SyncResult};
pub use queue::{OfflineQueue, OperationRepository};
pub use sources::{SourceAdapter, SourceRegistry, SourceResult};
pub use store::{
    DeliveryOutcome, DeliveryTarget, EventRepository, MergeAction, MergeReport, SkipReason,
    UnifiedEventStore,
};
