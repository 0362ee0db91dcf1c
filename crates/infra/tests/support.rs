//! Shared fixtures for the infra integration tests: an in-memory calendar
//! provider with a change log, and an engine wired for fast retries.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calsync_common::testing::async_utils::poll_until;
use calsync_common::BackoffPolicy;
use calsync_core::{SourceAdapter, SourceResult};
use calsync_domain::{
    CalendarInfo, ChangePage, Config, ConnectivityState, EventPayload, ProviderCapabilities,
    RawEventChange, RemoteWrite, SourceError, SourceKind,
};
use calsync_infra::sync::QueueWorkerConfig;
use calsync_infra::CalendarSyncEngine;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Mutex;

pub const CALENDAR: &str = "primary";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// 2025-06-02 at `hour`:00 UTC
pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).unwrap()
}

pub fn meeting(title: &str, hour: u32) -> EventPayload {
    EventPayload::new(title, at(hour), None)
}

#[derive(Default)]
struct ProviderState {
    events: BTreeMap<String, (EventPayload, u32)>,
    log: Vec<RawEventChange>,
    created: usize,
    idempotency: HashMap<String, String>,
    fetch_script: VecDeque<Option<SourceError>>,
    create_failures: VecDeque<SourceError>,
    update_failures: VecDeque<SourceError>,
    delete_failures: VecDeque<SourceError>,
    calls: Vec<String>,
}

impl ProviderState {
    fn record(&mut self, remote_id: &str, payload: EventPayload) -> u32 {
        let version = self.events.get(remote_id).map_or(1, |(_, version)| version + 1);
        self.log.push(
            RawEventChange::upsert(remote_id, CALENDAR, &payload).with_version(format!("v{version}")),
        );
        self.events.insert(remote_id.to_string(), (payload, version));
        version
    }

    fn remove(&mut self, remote_id: &str) -> bool {
        let removed = self.events.remove(remote_id).is_some();
        if removed {
            self.log.push(RawEventChange::deleted(remote_id, CALENDAR));
        }
        removed
    }
}

/// Provider double with one calendar.
///
/// Cursors are positions in the change log (`c3`); a full listing returns
/// every live event. Failures are scripted per call type and consumed in
/// order.
pub struct FakeProvider {
    kind: SourceKind,
    capabilities: ProviderCapabilities,
    page_size: Option<usize>,
    fetch_delay: Duration,
    write_delay: Duration,
    state: Mutex<ProviderState>,
    fetches_in_flight: AtomicUsize,
    max_fetches_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            capabilities: ProviderCapabilities {
                delta_sync: true,
                push_notifications: false,
                idempotency_keys: true,
            },
            page_size: None,
            fetch_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            state: Mutex::new(ProviderState::default()),
            fetches_in_flight: AtomicUsize::new(0),
            max_fetches_in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Hold every create, update and delete for `delay` before answering
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    #[must_use]
    pub fn with_push_notifications(mut self) -> Self {
        self.capabilities.push_notifications = true;
        self
    }

    /// Event created or edited on the provider side
    pub async fn remote_upsert(&self, remote_id: &str, payload: EventPayload) {
        self.state.lock().await.record(remote_id, payload);
    }

    /// Event deleted on the provider side
    pub async fn remote_delete(&self, remote_id: &str) {
        self.state.lock().await.remove(remote_id);
    }

    /// Outcomes of the next fetches: `None` succeeds, `Some` fails
    pub async fn script_fetches(&self, script: impl IntoIterator<Item = Option<SourceError>>) {
        self.state.lock().await.fetch_script.extend(script);
    }

    pub async fn fail_creates(&self, errors: impl IntoIterator<Item = SourceError>) {
        self.state.lock().await.create_failures.extend(errors);
    }

    pub async fn fail_updates(&self, errors: impl IntoIterator<Item = SourceError>) {
        self.state.lock().await.update_failures.extend(errors);
    }

    pub async fn fail_deletes(&self, errors: impl IntoIterator<Item = SourceError>) {
        self.state.lock().await.delete_failures.extend(errors);
    }

    pub async fn remote_event(&self, remote_id: &str) -> Option<EventPayload> {
        self.state.lock().await.events.get(remote_id).map(|(payload, _)| payload.clone())
    }

    pub async fn remote_ids(&self) -> Vec<String> {
        self.state.lock().await.events.keys().cloned().collect()
    }

    /// Every call in order, e.g. `create:Standup`, `update:google-1`
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, prefix: &str) -> usize {
        self.state.lock().await.calls.iter().filter(|call| call.starts_with(prefix)).count()
    }

    pub fn fetches_in_flight(&self) -> usize {
        self.fetches_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_fetches_in_flight.load(Ordering::SeqCst)
    }

    async fn stall_write(&self) {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
    }

    async fn fetch_page(&self, calendar_id: &str, cursor: Option<&str>) -> SourceResult<ChangePage> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("fetch:{}", cursor.unwrap_or("-")));
        if let Some(Some(err)) = state.fetch_script.pop_front() {
            return Err(err);
        }

        let Some(cursor) = cursor else {
            let changes = state
                .events
                .iter()
                .map(|(remote_id, (payload, version))| {
                    RawEventChange::upsert(remote_id, calendar_id, payload)
                        .with_version(format!("v{version}"))
                })
                .collect();
            return Ok(ChangePage {
                changes,
                next_cursor: Some(format!("c{}", state.log.len())),
                has_more: false,
            });
        };

        let position = cursor
            .strip_prefix('c')
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|position| *position <= state.log.len())
            .ok_or_else(|| SourceError::CursorInvalid(format!("unknown cursor {cursor}")))?;
        let end = self
            .page_size
            .map_or(state.log.len(), |size| (position + size).min(state.log.len()));
        Ok(ChangePage {
            changes: state.log[position..end].to_vec(),
            next_cursor: Some(format!("c{end}")),
            has_more: end < state.log.len(),
        })
    }
}

#[async_trait]
impl SourceAdapter for FakeProvider {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn list_calendars(&self) -> SourceResult<Vec<CalendarInfo>> {
        Ok(vec![CalendarInfo {
            calendar_id: CALENDAR.to_string(),
            name: "Primary".to_string(),
            read_only: false,
        }])
    }

    async fn fetch_changes(&self, calendar_id: &str, cursor: Option<&str>) -> SourceResult<ChangePage> {
        let running = self.fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_fetches_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let result = self.fetch_page(calendar_id, cursor).await;
        self.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn create_remote(
        &self,
        _calendar_id: &str,
        payload: &EventPayload,
        idempotency_key: Option<&str>,
    ) -> SourceResult<RemoteWrite> {
        self.stall_write().await;
        let mut state = self.state.lock().await;
        state.calls.push(format!("create:{}", payload.title));
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        if let Some(remote_id) = idempotency_key.and_then(|key| state.idempotency.get(key)).cloned() {
            let version = state.events.get(&remote_id).map_or(1, |(_, version)| *version);
            return Ok(RemoteWrite { remote_id, version: Some(format!("v{version}")) });
        }

        state.created += 1;
        let remote_id = format!("{}-{}", self.kind, state.created);
        let version = state.record(&remote_id, payload.clone());
        if let Some(key) = idempotency_key {
            state.idempotency.insert(key.to_string(), remote_id.clone());
        }
        Ok(RemoteWrite { remote_id, version: Some(format!("v{version}")) })
    }

    async fn update_remote(
        &self,
        _calendar_id: &str,
        remote_id: &str,
        payload: &EventPayload,
        expected_version: Option<&str>,
    ) -> SourceResult<Option<String>> {
        self.stall_write().await;
        let mut state = self.state.lock().await;
        state.calls.push(format!("update:{remote_id}"));
        if let Some(err) = state.update_failures.pop_front() {
            return Err(err);
        }
        let Some((_, current)) = state.events.get(remote_id) else {
            return Err(SourceError::NotFound(remote_id.to_string()));
        };
        let current = format!("v{current}");
        if expected_version.is_some_and(|expected| expected != current) {
            return Err(SourceError::VersionConflict(format!("{remote_id} is at {current}")));
        }
        let version = state.record(remote_id, payload.clone());
        Ok(Some(format!("v{version}")))
    }

    async fn delete_remote(&self, _calendar_id: &str, remote_id: &str) -> SourceResult<bool> {
        self.stall_write().await;
        let mut state = self.state.lock().await;
        state.calls.push(format!("delete:{remote_id}"));
        if let Some(err) = state.delete_failures.pop_front() {
            return Err(err);
        }
        Ok(state.remove(remote_id))
    }

    async fn renew_push_subscription(&self) -> SourceResult<DateTime<Utc>> {
        self.state.lock().await.calls.push("renew".to_string());
        Ok(Utc::now() + chrono::Duration::days(1))
    }
}

/// Configuration for an engine whose database lives in `dir`
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.database.path = dir.path().join("calsync.db").display().to_string();
    config.sync.enabled = false;
    config.sync.pass_timeout_seconds = 5;
    config
}

/// Six attempts, 10ms doubling to 80ms, no jitter
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(6, Duration::from_millis(10), Duration::from_millis(80))
        .unwrap()
        .with_max_jitter(Duration::ZERO)
}

pub fn fast_worker() -> QueueWorkerConfig {
    QueueWorkerConfig {
        operation_timeout: Duration::from_secs(2),
        rate_limit_delay: Duration::from_millis(20),
        poll_interval: Duration::from_millis(50),
        min_poll_interval: Duration::from_millis(5),
        join_timeout: Duration::from_secs(2),
        ..QueueWorkerConfig::default()
    }
}

pub fn build_engine(
    dir: &TempDir,
    adapters: &[Arc<FakeProvider>],
    connectivity: ConnectivityState,
) -> CalendarSyncEngine {
    build_engine_with(test_config(dir), adapters, connectivity)
}

pub fn build_engine_with(
    config: Config,
    adapters: &[Arc<FakeProvider>],
    connectivity: ConnectivityState,
) -> CalendarSyncEngine {
    build_engine_tuned(config, fast_backoff(), fast_worker(), adapters, connectivity)
}

pub fn build_engine_tuned(
    config: Config,
    backoff: BackoffPolicy,
    worker: QueueWorkerConfig,
    adapters: &[Arc<FakeProvider>],
    connectivity: ConnectivityState,
) -> CalendarSyncEngine {
    let mut builder = CalendarSyncEngine::builder(config)
        .with_backoff(backoff)
        .with_queue_worker_config(worker)
        .with_connectivity(connectivity)
        .with_join_timeout(Duration::from_secs(2));
    for adapter in adapters {
        builder = builder.with_adapter(Arc::clone(adapter) as Arc<dyn SourceAdapter>);
    }
    builder.build().unwrap()
}

/// Wait until `condition` holds, polling every few milliseconds
pub async fn wait_until<F, Fut>(condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    poll_until(WAIT_TIMEOUT, WAIT_INTERVAL, condition).await
}

/// Trigger a sync of `sources` and wait for every pass to finish
pub async fn sync_and_wait(engine: &CalendarSyncEngine, sources: &[SourceKind]) {
    engine.sync_now(sources);
    let idle = wait_until(move || async move { engine.is_idle() }).await;
    assert!(idle, "sync passes did not finish");
}
