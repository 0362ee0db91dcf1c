//! Scripted source adapter

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use calsync_core::{SourceAdapter, SourceResult};
use calsync_domain::{
    CalendarInfo, ChangePage, EventPayload, ProviderCapabilities, RemoteWrite, SourceError,
    SourceKind,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Adapter that replays queued fetch results and records the cursors it was
/// asked for.
pub struct ScriptedAdapter {
    kind: SourceKind,
    pages: Mutex<VecDeque<SourceResult<ChangePage>>>,
    requested: Mutex<Vec<Option<String>>>,
    delay: Duration,
}

impl ScriptedAdapter {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            pages: Mutex::new(VecDeque::new()),
            requested: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Hold every fetch for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn push(&self, result: SourceResult<ChangePage>) {
        self.pages.lock().await.push_back(result);
    }

    pub async fn requested_cursors(&self) -> Vec<Option<String>> {
        self.requested.lock().await.clone()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities { delta_sync: true, ..ProviderCapabilities::default() }
    }

    async fn list_calendars(&self) -> SourceResult<Vec<CalendarInfo>> {
        Ok(vec![CalendarInfo {
            calendar_id: "primary".into(),
            name: "Primary".into(),
            read_only: false,
        }])
    }

    async fn fetch_changes(
        &self,
        _calendar_id: &str,
        cursor: Option<&str>,
    ) -> SourceResult<ChangePage> {
        self.requested.lock().await.push(cursor.map(str::to_string));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.pages.lock().await.pop_front().unwrap_or_else(|| Ok(ChangePage::default()))
    }

    async fn create_remote(
        &self,
        _calendar_id: &str,
        _payload: &EventPayload,
        _idempotency_key: Option<&str>,
    ) -> SourceResult<RemoteWrite> {
        Err(SourceError::PermanentRejection("read-only script".into()))
    }

    async fn update_remote(
        &self,
        _calendar_id: &str,
        _remote_id: &str,
        _payload: &EventPayload,
        _expected_version: Option<&str>,
    ) -> SourceResult<Option<String>> {
        Err(SourceError::PermanentRejection("read-only script".into()))
    }

    async fn delete_remote(&self, _calendar_id: &str, _remote_id: &str) -> SourceResult<bool> {
        Err(SourceError::PermanentRejection("read-only script".into()))
    }

    async fn renew_push_subscription(&self) -> SourceResult<DateTime<Utc>> {
        Err(SourceError::PermanentRejection("push not supported".into()))
    }
}
