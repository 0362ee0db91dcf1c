//! Sync pass, cursor and provider exchange types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{resolve_end_time, EventPayload, SourceKind};
use crate::constants::UNTITLED_EVENT_TITLE;

/// Whether a remote change adds/updates or removes an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upsert,
    Deleted,
}

/// Event change as reported by a provider, before normalisation.
///
/// Providers omit fields freely; [`RawEventChange::payload`] fills the gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventChange {
    pub remote_id: String,
    pub calendar_id: String,
    #[serde(default)]
    pub calendar_name: Option<String>,
    pub kind: ChangeKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub organizer: Option<String>,
    /// Provider ETag or change key
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl RawEventChange {
    /// Upsert carrying the given payload.
    pub fn upsert(
        remote_id: impl Into<String>,
        calendar_id: impl Into<String>,
        payload: &EventPayload,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            calendar_id: calendar_id.into(),
            calendar_name: None,
            kind: ChangeKind::Upsert,
            title: Some(payload.title.clone()),
            start_time: Some(payload.start_time),
            end_time: Some(payload.end_time),
            is_all_day: payload.is_all_day,
            location: payload.location.clone(),
            notes: payload.notes.clone(),
            organizer: payload.organizer.clone(),
            version: None,
            modified_at: None,
        }
    }

    /// Tombstone for a remote deletion.
    pub fn deleted(remote_id: impl Into<String>, calendar_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            calendar_id: calendar_id.into(),
            calendar_name: None,
            kind: ChangeKind::Deleted,
            title: None,
            start_time: None,
            end_time: None,
            is_all_day: false,
            location: None,
            notes: None,
            organizer: None,
            version: None,
            modified_at: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub const fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    pub const fn is_deletion(&self) -> bool {
        matches!(self.kind, ChangeKind::Deleted)
    }

    /// Normalised payload.
    ///
    /// Returns `None` for deletions and for upserts without a start time,
    /// which cannot be placed on a calendar.
    pub fn payload(&self) -> Option<EventPayload> {
        if self.is_deletion() {
            return None;
        }
        let start_time = self.start_time?;
        let title = self
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(UNTITLED_EVENT_TITLE)
            .to_string();

        Some(EventPayload {
            title,
            start_time,
            end_time: resolve_end_time(start_time, self.end_time, self.is_all_day),
            is_all_day: self.is_all_day,
            location: self.location.clone(),
            notes: self.notes.clone(),
            organizer: self.organizer.clone(),
        })
    }
}

/// One page returned by an incremental fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePage {
    pub changes: Vec<RawEventChange>,
    /// Token to persist once every page of the pass has been merged
    pub next_cursor: Option<String>,
    /// More pages follow; fetch again with `next_cursor` as a continuation
    /// without persisting it
    pub has_more: bool,
}

/// A calendar inside a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub calendar_id: String,
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Result of a successful remote create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWrite {
    pub remote_id: String,
    pub version: Option<String>,
}

/// Per-(source, calendar) incremental sync position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub source: SourceKind,
    pub calendar_id: String,
    /// `None` means the next pass must be a full resync
    pub token: Option<String>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    /// Consecutive invalidations since the last successful pass
    pub invalidation_count: u32,
}

impl SyncCursor {
    pub fn empty(source: SourceKind, calendar_id: impl Into<String>) -> Self {
        Self {
            source,
            calendar_id: calendar_id.into(),
            token: None,
            last_successful_sync_at: None,
            invalidation_count: 0,
        }
    }

    pub const fn requires_full_resync(&self) -> bool {
        self.token.is_none()
    }
}

/// Identifier returned by a sync trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncRunId(Uuid);

impl SyncRunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SyncRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Observable per-source sync state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceSyncState {
    #[default]
    Idle,
    Syncing,
    Success {
        at: DateTime<Utc>,
    },
    Failed {
        error: String,
        /// Source is blocked until re-authentication
        auth_expired: bool,
    },
}

impl SourceSyncState {
    pub const fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing)
    }
}

/// State of every registered source.
pub type SyncStateSnapshot = BTreeMap<SourceKind, SourceSyncState>;

/// How a conflict is (or should be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    KeepBoth,
    Merge,
    Defer,
}

crate::impl_domain_status_conversions!(ResolutionStrategy {
    KeepLocal => "keep_local",
    KeepRemote => "keep_remote",
    KeepBoth => "keep_both",
    Merge => "merge",
    Defer => "defer",
});

/// Network reachability as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Offline,
    Online,
}

impl ConnectivityState {
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Terminal conditions surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum EngineAlert {
    /// Sync and delivery for the source are blocked until re-authentication
    AuthExpired { source: SourceKind, message: String },
    /// Queued mutation gave up; can be retried from the abandoned list
    OperationAbandoned { operation_id: String, logical_id: String, error: String },
    /// A record needs a user decision
    ConflictDetected { logical_id: String },
    /// Provider keeps rejecting the sync cursor
    CursorResetRepeated { source: SourceKind, calendar_id: String, count: u32 },
}
