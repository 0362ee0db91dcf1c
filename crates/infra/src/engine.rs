//! Calendar sync engine
//!
//! Composition root: wires the SQLite repositories, the unified store, the
//! delta coordinator, the orchestrator, the queue worker, the scheduler and
//! the reachability monitor together, and exposes the consumer API.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use calsync_core::SourceAdapter;
//! use calsync_domain::Config;
//! use calsync_infra::CalendarSyncEngine;
//!
//! # async fn example(google: Arc<dyn SourceAdapter>) -> calsync_domain::Result<()> {
//! let engine = CalendarSyncEngine::builder(Config::default()).with_adapter(google).build()?;
//! engine.start().await?;
//!
//! let mut pending = engine.pending_operations_count();
//! engine.sync_all();
//! pending.changed().await.ok();
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use calsync_common::{BackoffPolicy, Clock, SystemClock};
use calsync_core::{
    ConflictDetector, ConflictPolicy, DeltaSyncCoordinator, OfflineQueue, SourceAdapter,
    SourceRegistry, UnifiedEventStore,
};
use calsync_domain::{
    CalSyncError, Config, ConnectivityState, EngineAlert, EventPayload, QueuedOperation,
    ResolutionStrategy, Result, SourceKind, SyncRunId, SyncStateSnapshot, UnifiedEvent,
};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::database::{
    DbManager, SqliteCursorRepository, SqliteEventRepository, SqliteOperationRepository,
};
use crate::observability::metrics::{SyncMetrics, SyncMetricsSnapshot};
use crate::scheduling::{SchedulerError, SchedulerResult, SyncScheduler, SyncSchedulerConfig};
use crate::sync::{
    DrainReport, OrchestratorConfig, OrchestratorContext, QueueWorker, QueueWorkerConfig,
    QueueWorkerContext, ReachabilityMonitor, SyncOrchestrator,
};

const ALERT_CAPACITY: usize = 64;
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`CalendarSyncEngine`]
pub struct CalendarSyncEngineBuilder {
    config: Config,
    registry: SourceRegistry,
    clock: Arc<dyn Clock>,
    backoff: Option<BackoffPolicy>,
    connectivity: ConnectivityState,
    worker_config: Option<QueueWorkerConfig>,
    scheduler_config: Option<SyncSchedulerConfig>,
    join_timeout: Duration,
}

impl CalendarSyncEngineBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            registry: SourceRegistry::new(),
            clock: Arc::new(SystemClock),
            backoff: None,
            connectivity: ConnectivityState::Online,
            worker_config: None,
            scheduler_config: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.registry.register(adapter);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the backoff policy derived from the queue settings
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Connectivity assumed until the first probe result
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: ConnectivityState) -> Self {
        self.connectivity = connectivity;
        self
    }

    #[must_use]
    pub fn with_queue_worker_config(mut self, config: QueueWorkerConfig) -> Self {
        self.worker_config = Some(config);
        self
    }

    #[must_use]
    pub fn with_scheduler_config(mut self, config: SyncSchedulerConfig) -> Self {
        self.scheduler_config = Some(config);
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Open the database and assemble the engine.
    ///
    /// Nothing runs until [`CalendarSyncEngine::start`].
    pub fn build(self) -> Result<CalendarSyncEngine> {
        self.config.validate()?;
        let backoff = match self.backoff {
            Some(backoff) => backoff,
            None => backoff_from_config(&self.config)?,
        };

        let db = Arc::new(DbManager::from_config(&self.config.database)?);
        let queue = Arc::new(OfflineQueue::new(
            Arc::new(SqliteOperationRepository::new(Arc::clone(&db))),
            Arc::clone(&self.clock),
        ));
        let store = Arc::new(UnifiedEventStore::new(
            Arc::new(SqliteEventRepository::new(Arc::clone(&db))),
            queue,
            ConflictDetector::new(ConflictPolicy::from(&self.config.conflicts)),
            Arc::clone(&self.clock),
        ));
        let coordinator = Arc::new(
            DeltaSyncCoordinator::new(
                Arc::new(SqliteCursorRepository::new(Arc::clone(&db))),
                Arc::clone(&self.clock),
            )
            .with_fetch_timeout(self.config.sync.pass_timeout()),
        );

        let registry = Arc::new(self.registry);
        let reachability = Arc::new(ReachabilityMonitor::new(self.connectivity));
        let permits = Arc::new(Semaphore::new(self.config.sync.max_concurrent_passes));
        let metrics = Arc::new(SyncMetrics::new());
        let (alerts, _) = broadcast::channel(ALERT_CAPACITY);

        let orchestrator = SyncOrchestrator::new(
            OrchestratorContext {
                registry: Arc::clone(&registry),
                store: Arc::clone(&store),
                coordinator,
                clock: Arc::clone(&self.clock),
                permits: Arc::clone(&permits),
                metrics: Arc::clone(&metrics),
                alerts: alerts.clone(),
                connectivity: reachability.subscribe(),
            },
            OrchestratorConfig::from(&self.config.sync),
            backoff.clone(),
        );

        let worker_config = self
            .worker_config
            .unwrap_or_else(|| QueueWorkerConfig::from(&self.config.queue));
        let worker = QueueWorker::new(
            QueueWorkerContext {
                store: Arc::clone(&store),
                registry,
                orchestrator: orchestrator.clone(),
                clock: self.clock,
                permits,
                metrics: Arc::clone(&metrics),
                alerts: alerts.clone(),
                connectivity: reachability.subscribe(),
            },
            worker_config,
            backoff,
        );

        let scheduler = self.config.sync.enabled.then(|| {
            SyncScheduler::new(
                Arc::new(orchestrator.clone()),
                reachability.subscribe(),
                self.scheduler_config
                    .unwrap_or_else(|| SyncSchedulerConfig::from(&self.config.sync)),
            )
        });

        info!(
            sources = ?orchestrator.state().keys().collect::<Vec<_>>(),
            db_path = %db.path().display(),
            "calendar sync engine assembled"
        );

        Ok(CalendarSyncEngine {
            config: self.config,
            db,
            store,
            orchestrator,
            worker: Mutex::new(worker),
            scheduler: Mutex::new(scheduler),
            reachability,
            metrics,
            alerts,
            listener: Mutex::new(None),
            cancellation: parking_lot::Mutex::new(CancellationToken::new()),
            join_timeout: self.join_timeout,
        })
    }
}

/// Backoff policy described by the queue settings
pub fn backoff_from_config(config: &Config) -> Result<BackoffPolicy> {
    let queue = &config.queue;
    BackoffPolicy::new(
        queue.max_attempts,
        Duration::from_millis(queue.base_delay_ms),
        Duration::from_millis(queue.max_delay_ms),
    )
    .map(|policy| policy.with_max_jitter(Duration::from_millis(queue.max_jitter_ms)))
    .map_err(|err| CalSyncError::Config(format!("queue backoff: {err}")))
}

/// Multi-source calendar sync engine
pub struct CalendarSyncEngine {
    config: Config,
    db: Arc<DbManager>,
    store: Arc<UnifiedEventStore>,
    orchestrator: SyncOrchestrator,
    worker: Mutex<QueueWorker>,
    scheduler: Mutex<Option<SyncScheduler>>,
    reachability: Arc<ReachabilityMonitor>,
    metrics: Arc<SyncMetrics>,
    alerts: broadcast::Sender<EngineAlert>,
    listener: Mutex<Option<JoinHandle<()>>>,
    cancellation: parking_lot::Mutex<CancellationToken>,
    join_timeout: Duration,
}

impl CalendarSyncEngine {
    pub fn builder(config: Config) -> CalendarSyncEngineBuilder {
        CalendarSyncEngineBuilder::new(config)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Recover interrupted deliveries and start the background tasks.
    ///
    /// Operations left in flight by a previous run go back to pending, since
    /// their outcome is unknown.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let queue = self.store.queue();
        let recovered = queue.reset_in_flight().await?;
        if recovered > 0 {
            info!(recovered, "interrupted operations returned to pending");
        }
        queue.refresh_count().await?;

        self.worker.lock().await.start()?;
        if let Some(scheduler) = self.scheduler.lock().await.as_mut() {
            scheduler.start()?;
        }
        self.start_listener().await?;

        // Deliver whatever survived the restart
        queue.wake();
        info!(pending = queue.pending_count(), "calendar sync engine started");
        Ok(())
    }

    /// Stop background tasks and wait for running passes.
    ///
    /// Passes still waiting for a worker slot are cancelled.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        self.cancellation.lock().cancel();
        if let Some(handle) = self.listener.lock().await.take() {
            join_with_timeout(handle, self.join_timeout).await?;
        }
        if let Some(scheduler) = self.scheduler.lock().await.as_mut() {
            ignore_not_running(scheduler.stop().await)?;
        }
        ignore_not_running(self.worker.lock().await.stop().await)?;
        self.orchestrator.shutdown(self.join_timeout).await?;
        info!("calendar sync engine stopped");
        Ok(())
    }

    /// Forward connectivity transitions: coming online drains the queue and
    /// syncs every source.
    async fn start_listener(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(SchedulerError::AlreadyRunning.into());
        }

        let cancel = {
            let mut token = self.cancellation.lock();
            *token = CancellationToken::new();
            token.clone()
        };
        let mut connectivity = self.reachability.subscribe();
        let store = Arc::clone(&self.store);
        let orchestrator = self.orchestrator.clone();

        *listener = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *connectivity.borrow_and_update();
                        if state.is_online() {
                            debug!("back online, draining queue and syncing");
                            store.queue().wake();
                            orchestrator.trigger_all();
                        } else {
                            debug!("offline, new passes are suspended");
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_event(&self, logical_id: &str) -> Result<Option<UnifiedEvent>> {
        self.store.get(logical_id).await
    }

    /// Events intersecting `[start, end)`
    pub async fn events_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<UnifiedEvent>> {
        self.store.events_in_range(start, end).await
    }

    pub async fn events_for_calendar(&self, calendar_id: &str) -> Result<Vec<UnifiedEvent>> {
        self.store.events_for_calendar(calendar_id).await
    }

    /// Conflicted events, each carrying both candidates
    pub async fn conflicts(&self) -> Result<Vec<UnifiedEvent>> {
        self.store.conflicts().await
    }

    pub fn sync_state(&self) -> watch::Receiver<SyncStateSnapshot> {
        self.orchestrator.subscribe()
    }

    pub fn current_sync_state(&self) -> SyncStateSnapshot {
        self.orchestrator.state()
    }

    pub fn pending_operations_count(&self) -> watch::Receiver<usize> {
        self.store.queue().subscribe_pending_count()
    }

    pub fn pending_count(&self) -> usize {
        self.store.queue().pending_count()
    }

    pub fn alerts(&self) -> broadcast::Receiver<EngineAlert> {
        self.alerts.subscribe()
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<DbManager> {
        &self.db
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        self.store.queue()
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    pub async fn create_event(
        &self,
        source: SourceKind,
        calendar_id: &str,
        payload: EventPayload,
    ) -> Result<UnifiedEvent> {
        self.store.apply_local_create(source, calendar_id, payload).await
    }

    pub async fn update_event(&self, logical_id: &str, payload: EventPayload) -> Result<UnifiedEvent> {
        self.store.apply_local_update(logical_id, payload).await
    }

    pub async fn delete_event(&self, logical_id: &str) -> Result<()> {
        self.store.apply_local_delete(logical_id).await
    }

    pub async fn resolve_conflict(&self, logical_id: &str, strategy: ResolutionStrategy) -> Result<()> {
        self.store.resolve_conflict(logical_id, strategy).await?;
        self.store.queue().wake();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync control
    // ------------------------------------------------------------------

    pub fn sync_now(&self, sources: &[SourceKind]) -> SyncRunId {
        self.orchestrator.trigger_sync(sources)
    }

    pub fn sync_all(&self) -> SyncRunId {
        self.orchestrator.trigger_all()
    }

    /// Drop passes that have not started yet
    pub fn cancel_pending_sync(&self) {
        self.orchestrator.cancel_pending();
    }

    /// Deliver every ready operation now
    pub async fn drain(&self) -> Result<DrainReport> {
        self.worker.lock().await.drain().await
    }

    /// Report the latest connectivity probe; returns `true` on a transition
    pub fn set_online(&self, online: bool) -> bool {
        self.reachability.set_online(online)
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.reachability.state()
    }

    /// Fresh credentials for a source: unblock it, resume its deliveries and
    /// sync it.
    #[instrument(skip(self))]
    pub fn reauthenticated(&self, source: SourceKind) -> SyncRunId {
        if !self.orchestrator.unblock_source(source) {
            debug!(%source, "source was not blocked");
        }
        self.store.queue().wake();
        self.orchestrator.trigger_sync(&[source])
    }

    /// No pass is running, queued or scheduled for retry
    pub fn is_idle(&self) -> bool {
        self.orchestrator.is_idle()
    }

    // ------------------------------------------------------------------
    // Abandoned operations
    // ------------------------------------------------------------------

    pub async fn abandoned_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.store.queue().abandoned().await
    }

    /// Give an abandoned operation a fresh retry budget
    pub async fn retry_operation(&self, operation_id: &str) -> Result<QueuedOperation> {
        let operation = self.store.retry_abandoned(operation_id).await?;
        self.store.queue().wake();
        Ok(operation)
    }
}

impl std::fmt::Debug for CalendarSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarSyncEngine")
            .field("db", &self.db)
            .field("orchestrator", &self.orchestrator)
            .field("connectivity", &self.reachability.state())
            .finish_non_exhaustive()
    }
}

impl Drop for CalendarSyncEngine {
    fn drop(&mut self) {
        let token = self.cancellation.lock();
        if !token.is_cancelled() {
            warn!("CalendarSyncEngine dropped without shutdown; cancelling background tasks");
            token.cancel();
        }
    }
}

async fn join_with_timeout(handle: JoinHandle<()>, join_timeout: Duration) -> SchedulerResult<()> {
    tokio::time::timeout(join_timeout, handle)
        .await
        .map_err(|source| SchedulerError::Timeout { duration: join_timeout, source })??;
    Ok(())
}

fn ignore_not_running(result: SchedulerResult<()>) -> SchedulerResult<()> {
    match result {
        Err(SchedulerError::NotRunning) => Ok(()),
        other => other,
    }
}
