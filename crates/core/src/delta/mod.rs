//! Incremental fetch and cursor bookkeeping

pub mod coordinator;
pub mod errors;
pub mod ports;

pub use coordinator::{DeltaFetch, DeltaSyncCoordinator};
pub use errors::{SyncError, SyncResult};
pub use ports::CursorRepository;
