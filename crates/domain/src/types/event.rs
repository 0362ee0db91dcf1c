//! Canonical event records held by the unified event store.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::queue::OperationKind;
use crate::constants::{ALL_DAY_EVENT_DURATION_HOURS, DEFAULT_EVENT_DURATION_MINUTES};
use crate::errors::{CalSyncError, Result};

/// Calendar source that owns write authority for a record.
///
/// Closed set: adding a provider means adding a variant, and every `match`
/// over sources has to account for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// On-device calendar store
    Local,
    Google,
    Microsoft,
    CalDav,
}

crate::impl_domain_status_conversions!(SourceKind {
    Local => "local",
    Google => "google",
    Microsoft => "microsoft",
    CalDav => "caldav",
});

impl SourceKind {
    /// Every source kind, in a stable order
    pub const ALL: [Self; 4] = [Self::Local, Self::Google, Self::Microsoft, Self::CalDav];

    /// Returns true for sources reached over the network
    pub const fn is_remote(self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Feature set a provider adapter declares about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Provider issues incremental sync tokens
    pub delta_sync: bool,
    /// Provider supports push-notification channels that must be renewed
    pub push_notifications: bool,
    /// Provider honours idempotency keys on create
    pub idempotency_keys: bool,
}

/// Individually mergeable fields of an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventField {
    Title,
    StartTime,
    EndTime,
    IsAllDay,
    Location,
    Notes,
    Organizer,
}

impl EventField {
    pub const ALL: [Self; 7] = [
        Self::Title,
        Self::StartTime,
        Self::EndTime,
        Self::IsAllDay,
        Self::Location,
        Self::Notes,
        Self::Organizer,
    ];

    /// Fields that move the event in time
    pub const fn is_schedule(self) -> bool {
        matches!(self, Self::StartTime | Self::EndTime | Self::IsAllDay)
    }
}

/// User-visible content of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
}

impl EventPayload {
    /// Build a timed payload. A missing or inverted end falls back to the
    /// default duration.
    pub fn new(
        title: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            title: title.into(),
            start_time,
            end_time: resolve_end_time(start_time, end_time, false),
            is_all_day: false,
            location: None,
            notes: None,
            organizer: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_organizer(mut self, organizer: impl Into<String>) -> Self {
        self.organizer = Some(organizer.into());
        self
    }

    /// Mark as all-day, re-deriving the end when it no longer covers a day.
    pub fn all_day(mut self) -> Self {
        self.is_all_day = true;
        if self.end_time <= self.start_time {
            self.end_time = resolve_end_time(self.start_time, None, true);
        }
        self
    }

    /// Returns true when the event intersects `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && self.end_time > start
    }

    /// Compare a single field against another payload.
    pub fn field_equals(&self, other: &Self, field: EventField) -> bool {
        match field {
            EventField::Title => self.title == other.title,
            EventField::StartTime => self.start_time == other.start_time,
            EventField::EndTime => self.end_time == other.end_time,
            EventField::IsAllDay => self.is_all_day == other.is_all_day,
            EventField::Location => self.location == other.location,
            EventField::Notes => self.notes == other.notes,
            EventField::Organizer => self.organizer == other.organizer,
        }
    }

    /// Copy a single field's value from `other`.
    pub fn copy_field_from(&mut self, other: &Self, field: EventField) {
        match field {
            EventField::Title => self.title.clone_from(&other.title),
            EventField::StartTime => self.start_time = other.start_time,
            EventField::EndTime => self.end_time = other.end_time,
            EventField::IsAllDay => self.is_all_day = other.is_all_day,
            EventField::Location => self.location.clone_from(&other.location),
            EventField::Notes => self.notes.clone_from(&other.notes),
            EventField::Organizer => self.organizer.clone_from(&other.organizer),
        }
    }

    /// Fields whose value differs between `self` and `other`.
    pub fn changed_fields(&self, other: &Self) -> BTreeSet<EventField> {
        EventField::ALL.into_iter().filter(|field| !self.field_equals(other, *field)).collect()
    }

    /// Field-level three-way merge.
    ///
    /// Returns `None` when a field was changed on both sides to different
    /// values.
    pub fn merge_disjoint(base: &Self, local: &Self, remote: &Self) -> Option<Self> {
        let local_changed = base.changed_fields(local);
        let remote_changed = base.changed_fields(remote);

        let contested = local_changed
            .intersection(&remote_changed)
            .any(|field| !local.field_equals(remote, *field));
        if contested {
            return None;
        }

        let mut merged = base.clone();
        for field in &local_changed {
            merged.copy_field_from(local, *field);
        }
        for field in &remote_changed {
            merged.copy_field_from(remote, *field);
        }
        Some(merged)
    }
}

/// End time for an event whose provider may omit or garble it.
pub fn resolve_end_time(
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    is_all_day: bool,
) -> DateTime<Utc> {
    let fallback = if is_all_day {
        Duration::hours(ALL_DAY_EVENT_DURATION_HOURS)
    } else {
        Duration::minutes(DEFAULT_EVENT_DURATION_MINUTES)
    };

    match end_time {
        Some(end) if end > start_time => end,
        _ => start_time.checked_add_signed(fallback).unwrap_or(start_time),
    }
}

/// Synchronisation status of a unified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Conflicted,
    Failed,
}

crate::impl_domain_status_conversions!(SyncStatus {
    Synced => "synced",
    PendingCreate => "pending_create",
    PendingUpdate => "pending_update",
    PendingDelete => "pending_delete",
    Conflicted => "conflicted",
    Failed => "failed",
});

impl SyncStatus {
    /// A local mutation has not been acknowledged by the source yet
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::PendingCreate | Self::PendingUpdate | Self::PendingDelete)
    }

    /// States that need no further automatic processing
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::Conflicted | Self::Failed)
    }

    /// Pending status that corresponds to an outstanding operation kind
    pub const fn pending_for(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Create => Self::PendingCreate,
            OperationKind::Update => Self::PendingUpdate,
            OperationKind::Delete => Self::PendingDelete,
        }
    }

    /// A record marked for deletion may only settle into a terminal state.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::PendingDelete => next.is_terminal() || matches!(next, Self::PendingDelete),
            _ => true,
        }
    }
}

/// One side of a deferred conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub payload: EventPayload,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Both candidate versions of a conflicted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCandidates {
    pub local: ConflictSide,
    pub remote: ConflictSide,
    /// The local mutation that was pending when the conflict was detected
    pub local_operation: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// A provider-side identity that resolves to a logical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: SourceKind,
    pub calendar_id: String,
    pub remote_id: String,
}

/// Canonical event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub logical_id: String,
    pub source_kind: SourceKind,
    pub remote_id: Option<String>,
    pub calendar_id: String,
    pub calendar_name: Option<String>,
    pub payload: EventPayload,
    /// Last payload acknowledged by the owning source; the common ancestor
    /// for field-level merges.
    pub base_payload: Option<EventPayload>,
    pub version: Option<String>,
    pub sync_status: SyncStatus,
    pub last_modified_local: Option<DateTime<Utc>>,
    pub last_modified_remote: Option<DateTime<Utc>>,
    pub conflict: Option<ConflictCandidates>,
    /// Additional provider identities (aliases) collapsed into this record
    pub source_refs: Vec<SourceRef>,
}

impl UnifiedEvent {
    /// A record created on this device and not yet delivered anywhere.
    pub fn new_local(
        logical_id: impl Into<String>,
        source_kind: SourceKind,
        calendar_id: impl Into<String>,
        payload: EventPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            source_kind,
            remote_id: None,
            calendar_id: calendar_id.into(),
            calendar_name: None,
            payload,
            base_payload: None,
            version: None,
            sync_status: SyncStatus::PendingCreate,
            last_modified_local: Some(now),
            last_modified_remote: None,
            conflict: None,
            source_refs: Vec::new(),
        }
    }

    /// Move to `next`, enforcing the deletion invariant.
    pub fn transition(&mut self, next: SyncStatus) -> Result<()> {
        if !self.sync_status.can_transition_to(next) {
            return Err(CalSyncError::InvalidTransition(format!(
                "{} cannot move from {} to {}",
                self.logical_id, self.sync_status, next
            )));
        }
        self.sync_status = next;
        Ok(())
    }

    pub const fn has_pending_local_change(&self) -> bool {
        self.sync_status.is_pending()
    }

    pub const fn is_conflicted(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Conflicted)
    }

    /// Returns true when `(source, remote_id)` resolves to this record.
    pub fn references(&self, source: SourceKind, remote_id: &str) -> bool {
        (self.source_kind == source && self.remote_id.as_deref() == Some(remote_id))
            || self
                .source_refs
                .iter()
                .any(|reference| reference.source == source && reference.remote_id == remote_id)
    }

    /// Register a provider identity; duplicates are ignored.
    pub fn add_source_ref(&mut self, reference: SourceRef) {
        if !self.source_refs.contains(&reference) {
            self.source_refs.push(reference);
        }
    }
}
