//! Offline queue worker
//!
//! Delivers queued local mutations to their providers. Each round asks the
//! queue for the operations that may run now (at most the oldest one per
//! record), dispatches them concurrently on the worker slots shared with
//! the orchestrator, and waits for the whole round before asking again, so
//! a record's operations reach the provider strictly in order.
//!
//! Outcome handling:
//! - success, and a delete of something already gone, retire the operation
//! - transient failures are retried with backoff until the attempt budget
//!   runs out, then abandoned and surfaced
//! - rate limiting waits at least as long as the provider asked
//! - version conflicts (and updates of vanished records) trigger a sync of
//!   the source so the conflict detector sees the remote state
//! - authentication failures block the source without spending an attempt
//! - permanent rejections are abandoned immediately
//!
//! The background loop follows the usual lifecycle rules: tracked join
//! handle, explicit cancellation and a bounded join on stop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use calsync_common::{BackoffPolicy, Clock};
use calsync_core::{DeliveryOutcome, DeliveryTarget, SourceAdapter, SourceRegistry, SourceResult, UnifiedEventStore};
use calsync_domain::{
    CalSyncError, ConnectivityState, EngineAlert, OperationKind, QueueConfig, QueuedOperation,
    Result, SourceError, SourceKind,
};
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::orchestrator::SyncOrchestrator;
use crate::observability::log_metric;
use crate::observability::metrics::SyncMetrics;
use crate::scheduling::{SchedulerError, SchedulerResult};

/// Queue worker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWorkerConfig {
    /// Operations fetched per round
    pub batch_size: usize,
    /// Upper bound for one provider call
    pub operation_timeout: Duration,
    /// Minimum wait after a rate-limit response without a retry hint
    pub rate_limit_delay: Duration,
    /// Longest the loop sleeps without a wake-up
    pub poll_interval: Duration,
    /// Shortest the loop sleeps between rounds
    pub min_poll_interval: Duration,
    /// Join timeout when stopping
    pub join_timeout: Duration,
}

impl From<&QueueConfig> for QueueWorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout(),
            rate_limit_delay: config.rate_limit_delay(),
            ..Self::default()
        }
    }
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            operation_timeout: Duration::from_secs(30),
            rate_limit_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
            min_poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Collaborators the worker drives
pub struct QueueWorkerContext {
    pub store: Arc<UnifiedEventStore>,
    pub registry: Arc<SourceRegistry>,
    pub orchestrator: SyncOrchestrator,
    pub clock: Arc<dyn Clock>,
    pub permits: Arc<Semaphore>,
    pub metrics: Arc<SyncMetrics>,
    pub alerts: broadcast::Sender<EngineAlert>,
    pub connectivity: watch::Receiver<ConnectivityState>,
}

/// Tally of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Operations dropped because their record is gone or conflicted
    pub discarded: usize,
    /// Operations put back untouched (source blocked)
    pub deferred: usize,
}

impl DrainReport {
    fn absorb(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Retried => self.retried += 1,
            Delivery::Abandoned => self.abandoned += 1,
            Delivery::Discarded => self.discarded += 1,
            Delivery::Deferred => self.deferred += 1,
        }
    }

    pub const fn attempted(&self) -> usize {
        self.delivered + self.retried + self.abandoned + self.discarded + self.deferred
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Retried,
    Abandoned,
    Discarded,
    Deferred,
}

struct WorkerInner {
    store: Arc<UnifiedEventStore>,
    registry: Arc<SourceRegistry>,
    orchestrator: SyncOrchestrator,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    metrics: Arc<SyncMetrics>,
    alerts: broadcast::Sender<EngineAlert>,
    connectivity: watch::Receiver<ConnectivityState>,
    backoff: BackoffPolicy,
    config: QueueWorkerConfig,
    /// One drain at a time keeps per-record dispatch ordered
    drain_gate: Mutex<()>,
}

/// Background deliverer for the offline queue
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl QueueWorker {
    pub fn new(context: QueueWorkerContext, config: QueueWorkerConfig, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store: context.store,
                registry: context.registry,
                orchestrator: context.orchestrator,
                clock: context.clock,
                permits: context.permits,
                metrics: context.metrics,
                alerts: context.alerts,
                connectivity: context.connectivity,
                backoff,
                config,
                drain_gate: Mutex::new(()),
            }),
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// Spawn the background delivery loop
    #[instrument(skip(self))]
    pub fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!("Starting queue worker");
        self.cancellation = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancellation.clone();
        self.task_handle = Some(tokio::spawn(async move {
            inner.process_loop(cancel).await;
        }));
        info!("Queue worker started");
        Ok(())
    }

    /// Stop the loop and wait for the current round to finish
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        let Some(handle) = self.task_handle.take() else {
            return Err(SchedulerError::NotRunning);
        };

        info!("Stopping queue worker");
        self.cancellation.cancel();
        let join_timeout = self.inner.config.join_timeout;
        tokio::time::timeout(join_timeout, handle)
            .await
            .map_err(|source| SchedulerError::Timeout { duration: join_timeout, source })??;

        info!("Queue worker stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Deliver everything that is ready now.
    ///
    /// Runs rounds until no operation is ready or the device goes offline.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.inner.drain().await
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("QueueWorker dropped while running; cancelling task");
            self.cancellation.cancel();
        }
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WorkerInner {
    fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    async fn process_loop(self: Arc<Self>, cancel: CancellationToken) {
        let waker = self.store.queue().waker();
        loop {
            let wait = self.next_wait().await;
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Queue worker loop cancelled");
                    break;
                }
                () = waker.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
            if !self.is_online() {
                continue;
            }
            match self.drain().await {
                Ok(report) if report.attempted() > 0 => {
                    debug!(
                        delivered = report.delivered,
                        retried = report.retried,
                        abandoned = report.abandoned,
                        "drain round finished"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "queue drain failed"),
            }
        }
    }

    /// Sleep until the earliest scheduled retry, within the poll bounds
    async fn next_wait(&self) -> Duration {
        let until_retry = match self.store.queue().next_retry_at().await {
            Ok(Some(at)) => (at - self.clock.utc_now()).to_std().unwrap_or(Duration::ZERO),
            Ok(None) => self.config.poll_interval,
            Err(err) => {
                warn!(error = %err, "failed to read next retry time");
                self.config.poll_interval
            }
        };
        until_retry.clamp(self.config.min_poll_interval, self.config.poll_interval.max(self.config.min_poll_interval))
    }

    async fn drain(self: &Arc<Self>) -> Result<DrainReport> {
        let _gate = self.drain_gate.lock().await;
        let mut report = DrainReport::default();

        while self.is_online() {
            let blocked: BTreeSet<SourceKind> = self.orchestrator.blocked_sources();
            let batch = self
                .store
                .queue()
                .ready_batch(self.clock.utc_now(), &blocked, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "dispatching queued operations");

            let mut round = JoinSet::new();
            for operation in batch {
                let inner = Arc::clone(self);
                round.spawn(async move { inner.dispatch(operation).await });
            }
            while let Some(joined) = round.join_next().await {
                match joined {
                    Ok(Ok(delivery)) => report.absorb(delivery),
                    Ok(Err(err)) => error!(error = %err, "queued operation could not be settled"),
                    Err(err) => error!(error = %err, "delivery task failed"),
                }
            }
        }

        if report.attempted() > 0 {
            info!(
                delivered = report.delivered,
                retried = report.retried,
                abandoned = report.abandoned,
                discarded = report.discarded,
                deferred = report.deferred,
                "queue drained"
            );
        }
        Ok(report)
    }

    #[instrument(skip(self, operation), fields(
        operation_id = %operation.operation_id,
        logical_id = %operation.target_logical_id,
        kind = %operation.kind,
        source = %operation.source,
    ))]
    async fn dispatch(&self, operation: QueuedOperation) -> Result<Delivery> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CalSyncError::Internal("worker pool closed".to_string()))?;

        let superseded = match self.store.get(&operation.target_logical_id).await? {
            None => true,
            Some(event) => event.is_conflicted(),
        };
        let target = if superseded { None } else { self.store.delivery_target(&operation).await? };
        let Some(target) = target else {
            self.store.discard_operation(&operation).await?;
            return Ok(Delivery::Discarded);
        };
        let Some(adapter) = self.registry.get(operation.source) else {
            let message = format!("no adapter registered for {}", operation.source);
            return self.abandon(operation, &message).await;
        };

        let operation = self.store.queue().mark_in_flight(operation).await?;
        let timeout = self.config.operation_timeout;
        let result = tokio::time::timeout(timeout, call_provider(adapter.as_ref(), &operation, &target))
            .await
            .unwrap_or(Err(SourceError::Timeout(timeout)));

        let fallback = operation.clone();
        match self.settle(operation, result).await {
            Ok(delivery) => Ok(delivery),
            Err(err) => {
                // Never leave an operation in flight after a local failure
                let delay = self.backoff.delay_for_attempt(1);
                self.store
                    .queue()
                    .requeue_without_penalty(fallback, Some(&err.to_string()), Some(delay))
                    .await?;
                Err(err)
            }
        }
    }

    async fn settle(
        &self,
        operation: QueuedOperation,
        result: SourceResult<DeliveryOutcome>,
    ) -> Result<Delivery> {
        let err = match result {
            Ok(outcome) => {
                self.store.record_delivery(&operation, outcome).await?;
                log_metric(self.metrics.record_operation_delivered(), "queue.delivered");
                return Ok(Delivery::Delivered);
            }
            Err(err) => err,
        };

        match &err {
            SourceError::AuthExpired(message) => {
                self.orchestrator.block_source(operation.source, message);
                self.store
                    .queue()
                    .requeue_without_penalty(operation, Some(&err.to_string()), None)
                    .await?;
                Ok(Delivery::Deferred)
            }
            SourceError::PermanentRejection(_) => self.abandon(operation, &err.to_string()).await,
            SourceError::VersionConflict(_) | SourceError::NotFound(_) => {
                debug!(error = %err, "remote moved underneath the operation, syncing source");
                self.orchestrator.trigger_sync(&[operation.source]);
                self.retry_or_abandon(operation, &err).await
            }
            _ => self.retry_or_abandon(operation, &err).await,
        }
    }

    async fn retry_or_abandon(&self, mut operation: QueuedOperation, err: &SourceError) -> Result<Delivery> {
        let attempts = operation.attempt_count.saturating_add(1);
        if self.backoff.is_exhausted(attempts) {
            operation.attempt_count = attempts;
            return self.abandon(operation, &err.to_string()).await;
        }

        let mut delay = self.backoff.delay_for_attempt(attempts);
        if matches!(err, SourceError::RateLimited { .. }) {
            delay = delay.max(err.retry_after().unwrap_or(self.config.rate_limit_delay));
        }
        self.store.queue().schedule_retry(operation, &err.to_string(), delay).await?;
        log_metric(self.metrics.record_operation_retried(), "queue.retried");
        Ok(Delivery::Retried)
    }

    async fn abandon(&self, operation: QueuedOperation, message: &str) -> Result<Delivery> {
        let abandoned = self.store.record_abandoned(operation, message).await?;
        log_metric(self.metrics.record_operation_abandoned(), "queue.abandoned");
        let alert = EngineAlert::OperationAbandoned {
            operation_id: abandoned.operation_id,
            logical_id: abandoned.target_logical_id,
            error: message.to_string(),
        };
        if self.alerts.send(alert).is_err() {
            debug!("no alert subscribers");
        }
        Ok(Delivery::Abandoned)
    }
}

/// Issue the provider call an operation stands for
async fn call_provider(
    adapter: &dyn SourceAdapter,
    operation: &QueuedOperation,
    target: &DeliveryTarget,
) -> SourceResult<DeliveryOutcome> {
    let calendar_id = operation.calendar_id.as_str();
    match operation.kind {
        OperationKind::Create => {
            let payload = operation.payload.as_ref().ok_or_else(|| missing_payload(operation))?;
            let key = adapter
                .capabilities()
                .idempotency_keys
                .then(|| operation.idempotency_key());
            adapter.create_remote(calendar_id, payload, key).await.map(DeliveryOutcome::Created)
        }
        OperationKind::Update => {
            let payload = operation.payload.as_ref().ok_or_else(|| missing_payload(operation))?;
            let remote_id = target.remote_id.as_deref().ok_or_else(|| {
                SourceError::PermanentRejection(format!(
                    "{} has no remote identity to update",
                    operation.target_logical_id
                ))
            })?;
            adapter
                .update_remote(calendar_id, remote_id, payload, target.version.as_deref())
                .await
                .map(|version| DeliveryOutcome::Updated { version })
        }
        OperationKind::Delete => {
            let Some(remote_id) = target.remote_id.as_deref() else {
                return Ok(DeliveryOutcome::Deleted);
            };
            match adapter.delete_remote(calendar_id, remote_id).await {
                Ok(_) | Err(SourceError::NotFound(_)) => Ok(DeliveryOutcome::Deleted),
                Err(err) => Err(err),
            }
        }
    }
}

fn missing_payload(operation: &QueuedOperation) -> SourceError {
    SourceError::PermanentRejection(format!(
        "{} operation {} carries no payload",
        operation.kind, operation.operation_id
    ))
}
