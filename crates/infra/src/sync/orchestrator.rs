//! Sync orchestrator
//!
//! Turns a trigger into one pass per (source, calendar) and runs the passes
//! on a bounded pool shared with the queue worker. A pass pages through the
//! provider's changes, merges every page into the store and only then asks
//! the coordinator to persist the final cursor.
//!
//! Rules enforced here:
//! - at most one pass per (source, calendar) runs at a time; a trigger that
//!   arrives meanwhile is folded into a single rerun
//! - a failed pass never aborts its siblings; transient failures are retried
//!   with backoff, authentication failures block the source
//! - [`SyncOrchestrator::cancel_pending`] drops passes still waiting for a
//!   worker slot and leaves running passes alone
//! - nothing new is scheduled while offline

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use calsync_common::{BackoffPolicy, Clock};
use calsync_core::{
    DeltaFetch, DeltaSyncCoordinator, MergeReport, SourceAdapter, SourceRegistry, SyncError,
    SyncResult, UnifiedEventStore,
};
use calsync_domain::{
    ConnectivityState, EngineAlert, SourceError, SourceKind, SourceSyncState, SyncConfig,
    SyncRunId, SyncStateSnapshot,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::observability::log_metric;
use crate::observability::metrics::SyncMetrics;
use crate::scheduling::{SchedulerError, SchedulerResult};

type PassKey = (SourceKind, String);

/// Retry bookkeeping key; `None` stands for the calendar listing itself
type RetryKey = (SourceKind, Option<String>);

/// Orchestrator tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound for each provider call of a pass. Store writes are
    /// never cut short.
    pub pass_timeout: Duration,
    /// Consecutive cursor resets before an alert is raised (0 disables)
    pub cursor_invalid_alert_threshold: u32,
}

impl From<&SyncConfig> for OrchestratorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            pass_timeout: config.pass_timeout(),
            cursor_invalid_alert_threshold: config.cursor_invalid_alert_threshold,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Collaborators the orchestrator drives
pub struct OrchestratorContext {
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<UnifiedEventStore>,
    pub coordinator: Arc<DeltaSyncCoordinator>,
    pub clock: Arc<dyn Clock>,
    /// Worker slots shared with the queue worker
    pub permits: Arc<Semaphore>,
    pub metrics: Arc<SyncMetrics>,
    pub alerts: broadcast::Sender<EngineAlert>,
    pub connectivity: watch::Receiver<ConnectivityState>,
}

#[derive(Debug, Default)]
struct SourceProgress {
    active: usize,
    previous: SourceSyncState,
    failure: Option<String>,
    succeeded: bool,
}

struct Inner {
    registry: Arc<SourceRegistry>,
    store: Arc<UnifiedEventStore>,
    coordinator: Arc<DeltaSyncCoordinator>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    metrics: Arc<SyncMetrics>,
    alerts: broadcast::Sender<EngineAlert>,
    connectivity: watch::Receiver<ConnectivityState>,
    config: OrchestratorConfig,
    backoff: BackoffPolicy,
    state: watch::Sender<SyncStateSnapshot>,
    /// Running passes; `Some(token)` once a rerun was requested
    passes: Mutex<HashMap<PassKey, Option<CancellationToken>>>,
    progress: Mutex<HashMap<SourceKind, SourceProgress>>,
    retries: Mutex<HashMap<RetryKey, u32>>,
    blocked: Mutex<BTreeSet<SourceKind>>,
    push_expiry: Mutex<BTreeMap<SourceKind, DateTime<Utc>>>,
    pending: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Schedules and runs sync passes
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(context: OrchestratorContext, config: OrchestratorConfig, backoff: BackoffPolicy) -> Self {
        let snapshot: SyncStateSnapshot = context
            .registry
            .kinds()
            .into_iter()
            .map(|kind| (kind, SourceSyncState::Idle))
            .collect();
        let (state, _) = watch::channel(snapshot);

        Self {
            inner: Arc::new(Inner {
                registry: context.registry,
                store: context.store,
                coordinator: context.coordinator,
                clock: context.clock,
                permits: context.permits,
                metrics: context.metrics,
                alerts: context.alerts,
                connectivity: context.connectivity,
                config,
                backoff,
                state,
                passes: Mutex::new(HashMap::new()),
                progress: Mutex::new(HashMap::new()),
                retries: Mutex::new(HashMap::new()),
                blocked: Mutex::new(BTreeSet::new()),
                push_expiry: Mutex::new(BTreeMap::new()),
                pending: Mutex::new(CancellationToken::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Start passes for every calendar of `sources` and return immediately.
    ///
    /// Blocked and unregistered sources are skipped; nothing starts while
    /// offline.
    pub fn trigger_sync(&self, sources: &[SourceKind]) -> SyncRunId {
        let run_id = SyncRunId::new();
        if self.inner.shutdown.is_cancelled() {
            debug!(%run_id, "orchestrator stopped, sync trigger ignored");
            return run_id;
        }
        if !self.inner.is_online() {
            info!(%run_id, "offline, sync trigger skipped");
            return run_id;
        }

        let token = self.inner.pending.lock().clone();
        for &source in sources {
            if self.inner.is_blocked(source) {
                debug!(%run_id, source = %source, "source blocked until re-authentication");
                continue;
            }
            let Some(adapter) = self.inner.registry.get(source) else {
                warn!(%run_id, source = %source, "no adapter registered for source");
                continue;
            };
            let inner = Arc::clone(&self.inner);
            let token = token.clone();
            self.inner.tasks.spawn(async move {
                inner.sync_source(adapter, run_id, token).await;
            });
        }
        debug!(%run_id, sources = sources.len(), "sync triggered");
        run_id
    }

    /// Trigger every registered source
    pub fn trigger_all(&self) -> SyncRunId {
        self.trigger_sync(&self.inner.registry.kinds())
    }

    /// Drop passes that have not started yet
    pub fn cancel_pending(&self) {
        let previous = std::mem::replace(&mut *self.inner.pending.lock(), CancellationToken::new());
        previous.cancel();
        info!("pending sync passes cancelled");
    }

    /// Per-source state stream
    pub fn subscribe(&self) -> watch::Receiver<SyncStateSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SyncStateSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Stop syncing and delivering for `source` until it is unblocked
    pub fn block_source(&self, source: SourceKind, message: &str) {
        self.inner.block(source, message);
    }

    /// Lift an authentication block; returns whether the source was blocked
    pub fn unblock_source(&self, source: SourceKind) -> bool {
        let removed = self.inner.blocked.lock().remove(&source);
        if removed {
            info!(source = %source, "source unblocked");
            self.inner.publish(source, SourceSyncState::Idle);
        }
        removed
    }

    pub fn is_blocked(&self, source: SourceKind) -> bool {
        self.inner.is_blocked(source)
    }

    pub fn blocked_sources(&self) -> BTreeSet<SourceKind> {
        self.inner.blocked.lock().clone()
    }

    /// Renew push channels of every unblocked source that supports them.
    ///
    /// Returns the new expiry of each renewed source.
    pub async fn renew_push_subscriptions(&self) -> BTreeMap<SourceKind, DateTime<Utc>> {
        let adapters: Vec<Arc<dyn SourceAdapter>> = self
            .inner
            .registry
            .kinds()
            .into_iter()
            .filter(|&kind| !self.inner.is_blocked(kind))
            .filter_map(|kind| self.inner.registry.get(kind))
            .filter(|adapter| adapter.capabilities().push_notifications)
            .collect();

        let timeout = self.inner.config.pass_timeout;
        let results = join_all(adapters.iter().map(|adapter| async move {
            (adapter.kind(), tokio::time::timeout(timeout, adapter.renew_push_subscription()).await)
        }))
        .await;

        let mut renewed = BTreeMap::new();
        for (source, result) in results {
            match result {
                Ok(Ok(expires_at)) => {
                    debug!(source = %source, %expires_at, "push subscription renewed");
                    renewed.insert(source, expires_at);
                }
                Ok(Err(SourceError::AuthExpired(message))) => self.inner.block(source, &message),
                Ok(Err(err)) => warn!(source = %source, error = %err, "push renewal failed"),
                Err(_) => warn!(source = %source, ?timeout, "push renewal timed out"),
            }
        }
        self.inner.push_expiry.lock().extend(renewed.iter().map(|(kind, at)| (*kind, *at)));
        renewed
    }

    /// Last known push-channel expiry of a source
    pub fn push_expiry(&self, source: SourceKind) -> Option<DateTime<Utc>> {
        self.inner.push_expiry.lock().get(&source).copied()
    }

    /// No pass is running, waiting for a slot or scheduled for retry
    pub fn is_idle(&self) -> bool {
        self.inner.passes.lock().is_empty() && self.inner.tasks.is_empty()
    }

    /// Cancel pending work and wait for running passes to finish
    pub async fn shutdown(&self, join_timeout: Duration) -> SchedulerResult<()> {
        self.inner.shutdown.cancel();
        self.cancel_pending();
        self.inner.tasks.close();
        tokio::time::timeout(join_timeout, self.inner.tasks.wait())
            .await
            .map_err(|source| SchedulerError::Timeout { duration: join_timeout, source })?;
        info!("sync orchestrator stopped");
        Ok(())
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("config", &self.inner.config)
            .field("running", &self.inner.passes.lock().len())
            .field("blocked", &*self.inner.blocked.lock())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    fn is_blocked(&self, source: SourceKind) -> bool {
        self.blocked.lock().contains(&source)
    }

    async fn sync_source(
        self: &Arc<Self>,
        adapter: Arc<dyn SourceAdapter>,
        run_id: SyncRunId,
        token: CancellationToken,
    ) {
        let source = adapter.kind();
        self.begin_source(source);

        match tokio::time::timeout(self.config.pass_timeout, adapter.list_calendars()).await {
            Ok(Ok(calendars)) => {
                self.retries.lock().remove(&(source, None));
                debug!(%run_id, source = %source, calendars = calendars.len(), "starting passes");
                let passes = calendars.into_iter().map(|calendar| {
                    self.run_coalesced(Arc::clone(&adapter), calendar.calendar_id, token.clone())
                });
                join_all(passes).await;
            }
            Ok(Err(err)) => self.record_failure(&adapter, None, SyncError::Source(err)),
            Err(_) => self.record_failure(
                &adapter,
                None,
                SyncError::Source(SourceError::Timeout(self.config.pass_timeout)),
            ),
        }

        self.end_source(source);
    }

    async fn run_coalesced(
        self: &Arc<Self>,
        adapter: Arc<dyn SourceAdapter>,
        calendar_id: String,
        token: CancellationToken,
    ) {
        let key = (adapter.kind(), calendar_id);
        {
            let mut passes = self.passes.lock();
            if let Some(rerun) = passes.get_mut(&key) {
                *rerun = Some(token);
                debug!(source = %key.0, calendar_id = %key.1, "pass already running, rerun queued");
                return;
            }
            passes.insert(key.clone(), None);
        }

        let mut token = token;
        loop {
            let result = self.run_pass(adapter.as_ref(), &key.1, &token).await;
            self.finish_pass(&adapter, &key.1, result);

            let rerun = {
                let mut passes = self.passes.lock();
                let next = passes
                    .get_mut(&key)
                    .and_then(Option::take)
                    .filter(|next| !next.is_cancelled())
                    .filter(|_| self.is_online() && !self.is_blocked(key.0));
                if next.is_none() {
                    passes.remove(&key);
                }
                next
            };
            match rerun {
                Some(next) => {
                    debug!(source = %key.0, calendar_id = %key.1, "running coalesced pass");
                    token = next;
                }
                None => break,
            }
        }
    }

    async fn run_pass(
        &self,
        adapter: &dyn SourceAdapter,
        calendar_id: &str,
        token: &CancellationToken,
    ) -> SyncResult<MergeReport> {
        let _permit = tokio::select! {
            biased;
            () = token.cancelled() => return Err(SyncError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| SyncError::Cancelled)?,
        };
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        log_metric(self.metrics.record_pass_started(), "sync.pass.started");
        let started = Instant::now();
        let report = self.execute_pass(adapter, calendar_id).await?;
        log_metric(
            self.metrics.record_pass_succeeded(report.changed(), started.elapsed()),
            "sync.pass.succeeded",
        );
        Ok(report)
    }

    async fn execute_pass(&self, adapter: &dyn SourceAdapter, calendar_id: &str) -> SyncResult<MergeReport> {
        let source = adapter.kind();
        let mut token = self.coordinator.cursor_for(source, calendar_id).await?.token;
        let mut full_listing = token.is_none();
        let mut resynced = false;
        let mut seen = HashSet::new();
        let mut report = MergeReport::default();

        loop {
            let page = match self.coordinator.fetch_changes(adapter, calendar_id, token.as_deref()).await? {
                DeltaFetch::Page(page) => page,
                DeltaFetch::FullResyncRequired { invalidation_count } => {
                    log_metric(self.metrics.record_cursor_reset(), "sync.cursor.reset");
                    self.check_reset_streak(source, calendar_id, invalidation_count);
                    if resynced || token.is_none() {
                        return Err(SyncError::ResyncRejected {
                            kind: source,
                            calendar_id: calendar_id.to_string(),
                        });
                    }
                    info!(source = %source, calendar_id, "restarting pass as a full resync");
                    resynced = true;
                    full_listing = true;
                    token = None;
                    seen.clear();
                    continue;
                }
            };

            if full_listing {
                seen.extend(
                    page.changes
                        .iter()
                        .filter(|change| !change.is_deletion())
                        .map(|change| change.remote_id.clone()),
                );
            }
            let merged = self.store.apply_remote_changes(source, calendar_id, &page.changes).await?;
            self.note_conflicts(&merged);
            report.absorb(merged);

            if page.has_more {
                match page.next_cursor {
                    Some(next) => {
                        token = Some(next);
                        continue;
                    }
                    None => {
                        return Err(SyncError::Source(SourceError::PermanentRejection(
                            "page reports more results without a continuation token".to_string(),
                        )));
                    }
                }
            }

            if full_listing {
                let reconciled = self.store.reconcile_missing(source, calendar_id, &seen).await?;
                self.note_conflicts(&reconciled);
                report.absorb(reconciled);
            }
            self.coordinator.commit_cursor(source, calendar_id, page.next_cursor, !resynced).await?;
            return Ok(report);
        }
    }

    fn finish_pass(self: &Arc<Self>, adapter: &Arc<dyn SourceAdapter>, calendar_id: &str, result: SyncResult<MergeReport>) {
        let source = adapter.kind();
        match result {
            Ok(report) => {
                self.retries.lock().remove(&(source, Some(calendar_id.to_string())));
                if let Some(progress) = self.progress.lock().get_mut(&source) {
                    progress.succeeded = true;
                }
                info!(
                    source = %source,
                    calendar_id,
                    changed = report.changed(),
                    skipped = report.skipped,
                    conflicts = report.conflicts.len(),
                    "sync pass completed"
                );
            }
            Err(SyncError::Cancelled) => {
                debug!(source = %source, calendar_id, "sync pass cancelled before start");
            }
            Err(err) => self.record_failure(adapter, Some(calendar_id), err),
        }
    }

    fn record_failure(self: &Arc<Self>, adapter: &Arc<dyn SourceAdapter>, calendar_id: Option<&str>, err: SyncError) {
        log_metric(self.metrics.record_pass_failed(), "sync.pass.failed");
        let source = adapter.kind();

        if let SyncError::Source(SourceError::AuthExpired(message)) = &err {
            self.block(source, message);
            return;
        }
        if let Some(progress) = self.progress.lock().get_mut(&source) {
            progress.failure = Some(err.to_string());
        }

        if err.is_transient() {
            warn!(source = %source, calendar_id, error = %err, "sync pass failed, scheduling retry");
            self.schedule_retry(Arc::clone(adapter), calendar_id.map(str::to_string));
        } else {
            error!(source = %source, calendar_id, error = %err, "sync pass failed");
        }
    }

    fn schedule_retry(self: &Arc<Self>, adapter: Arc<dyn SourceAdapter>, calendar_id: Option<String>) {
        let key = (adapter.kind(), calendar_id.clone());
        let attempt = {
            let mut retries = self.retries.lock();
            let attempt = retries.entry(key.clone()).or_insert(0);
            *attempt = attempt.saturating_add(1);
            *attempt
        };
        if self.backoff.is_exhausted(attempt) {
            self.retries.lock().remove(&key);
            warn!(
                source = %key.0,
                attempts = attempt,
                "pass retries exhausted, waiting for the next scheduled sync"
            );
            return;
        }

        let delay = self.backoff.delay_for_attempt(attempt);
        let inner = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => inner.retry(adapter, calendar_id).await,
            }
        });
    }

    async fn retry(self: &Arc<Self>, adapter: Arc<dyn SourceAdapter>, calendar_id: Option<String>) {
        let source = adapter.kind();
        if !self.is_online() || self.is_blocked(source) {
            debug!(source = %source, "retry skipped");
            return;
        }
        let token = self.pending.lock().clone();
        match calendar_id {
            Some(calendar_id) => {
                self.begin_source(source);
                self.run_coalesced(adapter, calendar_id, token).await;
                self.end_source(source);
            }
            None => self.sync_source(adapter, SyncRunId::new(), token).await,
        }
    }

    fn note_conflicts(&self, report: &MergeReport) {
        if report.conflicts.is_empty() {
            return;
        }
        log_metric(self.metrics.record_conflicts(report.conflicts.len()), "sync.conflicts");
        for logical_id in &report.conflicts {
            self.raise(EngineAlert::ConflictDetected { logical_id: logical_id.clone() });
        }
    }

    fn check_reset_streak(&self, source: SourceKind, calendar_id: &str, count: u32) {
        let threshold = self.config.cursor_invalid_alert_threshold;
        if threshold > 0 && count >= threshold {
            warn!(source = %source, calendar_id, count, "sync cursor keeps getting rejected");
            self.raise(EngineAlert::CursorResetRepeated {
                source,
                calendar_id: calendar_id.to_string(),
                count,
            });
        }
    }

    fn block(&self, source: SourceKind, message: &str) {
        let newly_blocked = self.blocked.lock().insert(source);
        self.publish(
            source,
            SourceSyncState::Failed { error: message.to_string(), auth_expired: true },
        );
        if newly_blocked {
            error!(source = %source, message, "authentication expired, source blocked");
            self.raise(EngineAlert::AuthExpired { source, message: message.to_string() });
        }
    }

    fn begin_source(&self, source: SourceKind) {
        let first = {
            let mut progress = self.progress.lock();
            let entry = progress.entry(source).or_insert_with(|| SourceProgress {
                previous: self.state.borrow().get(&source).cloned().unwrap_or_default(),
                ..SourceProgress::default()
            });
            entry.active += 1;
            entry.active == 1
        };
        if first {
            self.publish(source, SourceSyncState::Syncing);
        }
    }

    fn end_source(&self, source: SourceKind) {
        let finished = {
            let mut progress = self.progress.lock();
            let Some(entry) = progress.get_mut(&source) else {
                return;
            };
            entry.active = entry.active.saturating_sub(1);
            if entry.active > 0 {
                return;
            }
            progress.remove(&source)
        };
        let Some(progress) = finished else {
            return;
        };
        if self.is_blocked(source) {
            return;
        }

        let state = match (progress.failure, progress.succeeded) {
            (Some(error), _) => SourceSyncState::Failed { error, auth_expired: false },
            (None, true) => SourceSyncState::Success { at: self.clock.utc_now() },
            (None, false) => progress.previous,
        };
        self.publish(source, state);
    }

    fn publish(&self, source: SourceKind, state: SourceSyncState) {
        self.state.send_if_modified(|snapshot| {
            if snapshot.get(&source) == Some(&state) {
                return false;
            }
            snapshot.insert(source, state);
            true
        });
    }

    fn raise(&self, alert: EngineAlert) {
        if self.alerts.send(alert).is_err() {
            debug!("no alert subscribers");
        }
    }
}
