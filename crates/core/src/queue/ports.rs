//! Port interfaces for the durable operation queue

use async_trait::async_trait;
use calsync_domain::{OperationStatus, QueuedOperation, Result};

/// Durable, ordered storage of queued operations
#[async_trait]
pub trait OperationRepository: Send + Sync {
    /// Persist a new operation, returning it with its assigned sequence
    async fn insert(&self, operation: &QueuedOperation) -> Result<QueuedOperation>;

    async fn get(&self, operation_id: &str) -> Result<Option<QueuedOperation>>;

    /// Overwrite the mutable columns (status, attempts, retry time, error,
    /// remote id)
    async fn update(&self, operation: &QueuedOperation) -> Result<()>;

    /// Remove an operation; returns false when it did not exist
    async fn delete(&self, operation_id: &str) -> Result<bool>;

    /// Remove every `Pending` operation for a record, returning how many
    /// were removed
    async fn delete_pending_for(&self, logical_id: &str) -> Result<usize>;

    /// `Pending` and `InFlight` operations ordered by sequence
    async fn list_active(&self) -> Result<Vec<QueuedOperation>>;

    /// Operations in a status ordered by sequence
    async fn list_by_status(&self, status: OperationStatus) -> Result<Vec<QueuedOperation>>;

    /// Active operations for one record ordered by sequence
    async fn for_record(&self, logical_id: &str) -> Result<Vec<QueuedOperation>>;

    /// Number of `Pending` and `InFlight` operations
    async fn count_active(&self) -> Result<usize>;

    /// Move every `InFlight` operation back to `Pending`, returning the count
    async fn reset_in_flight(&self) -> Result<usize>;
}
