//! Offline queue service
//!
//! Owns every [`QueuedOperation`]. Operations are kept in insertion order;
//! only the oldest active operation of a record is ever handed out, so a
//! record's mutations reach the provider in the order they were made while
//! unrelated records drain concurrently.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use calsync_common::Clock;
use calsync_domain::{CalSyncError, OperationStatus, QueuedOperation, Result, SourceKind};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use super::ports::OperationRepository;

/// Durable FIFO of pending local mutations
pub struct OfflineQueue {
    repository: Arc<dyn OperationRepository>,
    clock: Arc<dyn Clock>,
    pending_count: watch::Sender<usize>,
    wake: Arc<Notify>,
}

impl OfflineQueue {
    pub fn new(repository: Arc<dyn OperationRepository>, clock: Arc<dyn Clock>) -> Self {
        let (pending_count, _) = watch::channel(0);
        Self { repository, clock, pending_count, wake: Arc::new(Notify::new()) }
    }

    /// Persist a new operation and wake the drain loop
    #[instrument(skip(self, operation), fields(
        operation_id = %operation.operation_id,
        logical_id = %operation.target_logical_id,
        kind = %operation.kind,
    ))]
    pub async fn enqueue(&self, operation: QueuedOperation) -> Result<String> {
        let stored = self.repository.insert(&operation).await?;
        debug!(sequence = stored.sequence, "operation enqueued");
        self.refresh_count().await?;
        self.wake.notify_one();
        Ok(stored.operation_id)
    }

    /// Drop the not-yet-started operations of a record
    pub async fn cancel_for_record(&self, logical_id: &str) -> Result<usize> {
        let removed = self.repository.delete_pending_for(logical_id).await?;
        if removed > 0 {
            debug!(logical_id, removed, "cancelled pending operations");
            self.refresh_count().await?;
        }
        Ok(removed)
    }

    /// Active operations of a record, oldest first
    pub async fn outstanding_for(&self, logical_id: &str) -> Result<Vec<QueuedOperation>> {
        self.repository.for_record(logical_id).await
    }

    pub async fn has_in_flight_for(&self, logical_id: &str) -> Result<bool> {
        Ok(self
            .outstanding_for(logical_id)
            .await?
            .iter()
            .any(|operation| operation.status == OperationStatus::InFlight))
    }

    pub async fn get(&self, operation_id: &str) -> Result<Option<QueuedOperation>> {
        self.repository.get(operation_id).await
    }

    /// Operations that may be dispatched now, oldest first.
    ///
    /// A record contributes at most its oldest operation, and nothing while
    /// that operation is in flight or while an earlier operation of the
    /// record sits abandoned. Sources in `blocked` are skipped.
    pub async fn ready_batch(
        &self,
        now: DateTime<Utc>,
        blocked: &BTreeSet<SourceKind>,
        limit: usize,
    ) -> Result<Vec<QueuedOperation>> {
        let active = self.repository.list_active().await?;
        let mut seen: HashSet<String> = self
            .repository
            .list_by_status(OperationStatus::Abandoned)
            .await?
            .into_iter()
            .map(|operation| operation.target_logical_id)
            .collect();

        let mut batch = Vec::new();
        for operation in active {
            if !seen.insert(operation.target_logical_id.clone()) {
                continue;
            }
            if blocked.contains(&operation.source) || !operation.is_ready(now) {
                continue;
            }
            batch.push(operation);
            if batch.len() >= limit {
                break;
            }
        }
        Ok(batch)
    }

    /// Earliest scheduled retry among pending operations
    pub async fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .repository
            .list_by_status(OperationStatus::Pending)
            .await?
            .iter()
            .filter_map(|operation| operation.next_retry_at)
            .min())
    }

    pub async fn mark_in_flight(&self, mut operation: QueuedOperation) -> Result<QueuedOperation> {
        operation.status = OperationStatus::InFlight;
        self.repository.update(&operation).await?;
        Ok(operation)
    }

    /// Delivery confirmed; the operation is destroyed
    #[instrument(skip(self, operation), fields(operation_id = %operation.operation_id))]
    pub async fn mark_succeeded(&self, operation: &QueuedOperation) -> Result<()> {
        self.repository.delete(&operation.operation_id).await?;
        debug!(attempts = operation.attempt_count + 1, "operation delivered");
        self.refresh_count().await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Count a failed attempt and schedule the next one after `delay`
    pub async fn schedule_retry(
        &self,
        mut operation: QueuedOperation,
        error: &str,
        delay: Duration,
    ) -> Result<QueuedOperation> {
        operation.attempt_count = operation.attempt_count.saturating_add(1);
        operation.status = OperationStatus::Pending;
        operation.next_retry_at = Some(self.after(delay));
        operation.set_error(error);
        self.repository.update(&operation).await?;
        warn!(
            operation_id = %operation.operation_id,
            attempt = operation.attempt_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error,
            "operation scheduled for retry"
        );
        Ok(operation)
    }

    /// Return an operation to `Pending` without counting an attempt
    pub async fn requeue_without_penalty(
        &self,
        mut operation: QueuedOperation,
        error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<QueuedOperation> {
        operation.status = OperationStatus::Pending;
        operation.next_retry_at = delay.map(|delay| self.after(delay));
        if let Some(error) = error {
            operation.set_error(error);
        }
        self.repository.update(&operation).await?;
        Ok(operation)
    }

    /// Give up on an operation; it stays listed until retried or the
    /// record disappears
    #[instrument(skip(self, operation), fields(operation_id = %operation.operation_id))]
    pub async fn abandon(
        &self,
        mut operation: QueuedOperation,
        error: &str,
    ) -> Result<QueuedOperation> {
        operation.status = OperationStatus::Abandoned;
        operation.next_retry_at = None;
        operation.set_error(error);
        self.repository.update(&operation).await?;
        warn!(
            logical_id = %operation.target_logical_id,
            attempts = operation.attempt_count,
            error,
            "operation abandoned"
        );
        self.refresh_count().await?;
        Ok(operation)
    }

    /// Remove an operation whose target no longer exists
    pub async fn discard(&self, operation: &QueuedOperation) -> Result<()> {
        self.repository.delete(&operation.operation_id).await?;
        self.refresh_count().await?;
        Ok(())
    }

    /// Crash recovery: anything left `InFlight` was not confirmed delivered
    pub async fn reset_in_flight(&self) -> Result<usize> {
        let reset = self.repository.reset_in_flight().await?;
        if reset > 0 {
            info!(reset, "reset in-flight operations to pending");
        }
        self.refresh_count().await?;
        Ok(reset)
    }

    pub async fn abandoned(&self) -> Result<Vec<QueuedOperation>> {
        self.repository.list_by_status(OperationStatus::Abandoned).await
    }

    /// Abandoned operations of one record, oldest first
    pub async fn abandoned_for(&self, logical_id: &str) -> Result<Vec<QueuedOperation>> {
        Ok(self
            .abandoned()
            .await?
            .into_iter()
            .filter(|operation| operation.target_logical_id == logical_id)
            .collect())
    }

    /// Drop the abandoned operations of a record that no longer needs them
    pub async fn discard_abandoned_for(&self, logical_id: &str) -> Result<usize> {
        let abandoned = self.abandoned_for(logical_id).await?;
        for operation in &abandoned {
            self.repository.delete(&operation.operation_id).await?;
        }
        Ok(abandoned.len())
    }

    /// Put an abandoned operation back with a fresh retry budget
    #[instrument(skip(self))]
    pub async fn retry_abandoned(&self, operation_id: &str) -> Result<QueuedOperation> {
        let mut operation = self
            .repository
            .get(operation_id)
            .await?
            .ok_or_else(|| CalSyncError::NotFound(format!("operation {operation_id}")))?;
        if operation.status != OperationStatus::Abandoned {
            return Err(CalSyncError::InvalidInput(format!(
                "operation {operation_id} is {}, not abandoned",
                operation.status
            )));
        }
        operation.status = OperationStatus::Pending;
        operation.attempt_count = 0;
        operation.next_retry_at = None;
        operation.last_error = None;
        self.repository.update(&operation).await?;
        info!(logical_id = %operation.target_logical_id, "abandoned operation requeued");
        self.refresh_count().await?;
        self.wake.notify_one();
        Ok(operation)
    }

    /// Current number of pending and in-flight operations
    pub fn pending_count(&self) -> usize {
        *self.pending_count.borrow()
    }

    pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
        self.pending_count.subscribe()
    }

    /// Re-read the active count from storage and publish it
    pub async fn refresh_count(&self) -> Result<usize> {
        let count = self.repository.count_active().await?;
        self.pending_count.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
        Ok(count)
    }

    /// Handle the drain loop waits on
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Nudge the drain loop
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        self.clock.utc_now() + delay
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue").field("pending_count", &self.pending_count()).finish()
    }
}
