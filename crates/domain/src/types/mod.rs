//! Domain types and models

pub mod event;
pub mod queue;
pub mod sync;

pub use event::{
    resolve_end_time, ConflictCandidates, ConflictSide, EventField, EventPayload,
    ProviderCapabilities, SourceKind, SourceRef, SyncStatus, UnifiedEvent,
};
pub use queue::{OperationKind, OperationStatus, QueuedOperation};
pub use sync::{
    CalendarInfo, ChangeKind, ChangePage, ConnectivityState, EngineAlert, RawEventChange,
    RemoteWrite, ResolutionStrategy, SourceSyncState, SyncCursor, SyncRunId, SyncStateSnapshot,
};
