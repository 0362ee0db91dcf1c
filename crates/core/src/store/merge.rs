//! Pure planning of how one remote change lands in the store
//!
//! [`plan_remote_change`] looks at the record a change resolved to (if any)
//! and decides what should happen without touching storage, so replaying a
//! batch is easy to reason about: a change that was already applied plans
//! to [`MergeAction::Skip`].

use calsync_domain::{
    ConflictSide, EventPayload, OperationKind, RawEventChange, SourceKind, SourceRef, SyncStatus,
    UnifiedEvent,
};
use chrono::{DateTime, Utc};

use super::identity::logical_id_for;
use crate::conflict::ConflictInput;

/// Why a change did not modify the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Deletion for a record the store never held
    UnknownRecord,
    /// Upsert without a start time
    Unplaceable,
    /// Already applied, or older than what the store holds
    Stale,
    /// Duplicate representation from a source that does not own the record
    AliasRefresh,
}

/// Outcome of planning one remote change
#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    Skip(SkipReason),
    /// New record, `Synced`
    Insert(UnifiedEvent),
    /// Replace an existing record
    Overwrite(UnifiedEvent),
    /// A second provider's copy of an existing meeting was collapsed into it
    AttachAlias(UnifiedEvent),
    /// A provider dropped its copy of an aliased record
    DetachAlias(UnifiedEvent),
    /// Remote deletion of a record without local changes
    Remove(String),
    /// New remote candidate for a record awaiting a user decision
    RefreshConflict(UnifiedEvent),
    /// Pending local mutation meets a divergent remote change
    Detect(Box<ConflictInput>),
}

/// Plan how `change`, reported by `source`, applies to `existing`.
///
/// `existing` is whatever the store resolved the change to: the record the
/// provider identity points at, or a cross-source duplicate found by
/// fingerprint. `abandoned` is the kind of the oldest abandoned operation of
/// a `Failed` record; its unsent mutation is treated like a pending one.
pub fn plan_remote_change(
    existing: Option<&UnifiedEvent>,
    abandoned: Option<OperationKind>,
    source: SourceKind,
    change: &RawEventChange,
    now: DateTime<Utc>,
) -> MergeAction {
    let Some(existing) = existing else {
        return plan_insert(source, change, now);
    };

    let is_owner = existing.source_kind == source
        && existing.remote_id.as_deref() == Some(change.remote_id.as_str());
    if !is_owner {
        return plan_alias(existing, source, change);
    }

    let payload = change.payload();
    if payload.is_none() && !change.is_deletion() {
        return MergeAction::Skip(SkipReason::Unplaceable);
    }

    let unsent = match existing.sync_status {
        SyncStatus::Failed => abandoned,
        status => pending_operation(status),
    };
    match (existing.sync_status, unsent) {
        (SyncStatus::Conflicted, _) => plan_conflict_refresh(existing, change, payload),
        (_, Some(local_operation)) => plan_pending(existing, change, payload, local_operation, now),
        (_, None) => match payload {
            None => plan_owner_removal(existing),
            Some(payload) => plan_overwrite(existing, change, payload, now),
        },
    }
}

/// Local operation kind implied by a pending status
pub const fn pending_operation(status: SyncStatus) -> Option<OperationKind> {
    match status {
        SyncStatus::PendingCreate => Some(OperationKind::Create),
        SyncStatus::PendingUpdate => Some(OperationKind::Update),
        SyncStatus::PendingDelete => Some(OperationKind::Delete),
        SyncStatus::Synced | SyncStatus::Conflicted | SyncStatus::Failed => None,
    }
}

/// Hand write authority to the first alias after the owner deleted its
/// copy. Returns false when there is no alias to promote.
pub fn promote_alias(event: &mut UnifiedEvent) -> bool {
    if event.source_refs.is_empty() {
        return false;
    }
    let alias = event.source_refs.remove(0);
    event.source_kind = alias.source;
    event.remote_id = Some(alias.remote_id);
    event.calendar_id = alias.calendar_id;
    event.version = None;
    event.base_payload = Some(event.payload.clone());
    true
}

fn plan_insert(source: SourceKind, change: &RawEventChange, now: DateTime<Utc>) -> MergeAction {
    if change.is_deletion() {
        return MergeAction::Skip(SkipReason::UnknownRecord);
    }
    let Some(payload) = change.payload() else {
        return MergeAction::Skip(SkipReason::Unplaceable);
    };
    MergeAction::Insert(UnifiedEvent {
        logical_id: logical_id_for(source, &change.remote_id),
        source_kind: source,
        remote_id: Some(change.remote_id.clone()),
        calendar_id: change.calendar_id.clone(),
        calendar_name: change.calendar_name.clone(),
        base_payload: Some(payload.clone()),
        payload,
        version: change.version.clone(),
        sync_status: SyncStatus::Synced,
        last_modified_local: None,
        last_modified_remote: Some(change.modified_at.unwrap_or(now)),
        conflict: None,
        source_refs: Vec::new(),
    })
}

fn plan_alias(existing: &UnifiedEvent, source: SourceKind, change: &RawEventChange) -> MergeAction {
    let aliased = existing.references(source, &change.remote_id);
    match (aliased, change.is_deletion()) {
        (true, false) => MergeAction::Skip(SkipReason::AliasRefresh),
        (true, true) => {
            let mut event = existing.clone();
            event.source_refs.retain(|reference| {
                !(reference.source == source && reference.remote_id == change.remote_id)
            });
            MergeAction::DetachAlias(event)
        }
        (false, true) => MergeAction::Skip(SkipReason::UnknownRecord),
        (false, false) => {
            let mut event = existing.clone();
            event.add_source_ref(SourceRef {
                source,
                calendar_id: change.calendar_id.clone(),
                remote_id: change.remote_id.clone(),
            });
            MergeAction::AttachAlias(event)
        }
    }
}

fn plan_owner_removal(existing: &UnifiedEvent) -> MergeAction {
    let mut event = existing.clone();
    if promote_alias(&mut event) {
        event.sync_status = SyncStatus::Synced;
        return MergeAction::Overwrite(event);
    }
    MergeAction::Remove(existing.logical_id.clone())
}

fn is_stale(existing: &UnifiedEvent, change: &RawEventChange, payload: &EventPayload) -> bool {
    if change.version.is_some() && change.version == existing.version {
        return true;
    }
    if let (Some(incoming), Some(held)) = (change.modified_at, existing.last_modified_remote) {
        if incoming < held {
            return true;
        }
    }
    *payload == existing.payload && change.version == existing.version
}

fn plan_overwrite(
    existing: &UnifiedEvent,
    change: &RawEventChange,
    payload: EventPayload,
    now: DateTime<Utc>,
) -> MergeAction {
    if is_stale(existing, change, &payload) {
        return MergeAction::Skip(SkipReason::Stale);
    }
    let mut event = existing.clone();
    event.base_payload = Some(payload.clone());
    event.payload = payload;
    event.version.clone_from(&change.version);
    event.sync_status = SyncStatus::Synced;
    event.last_modified_remote = Some(change.modified_at.unwrap_or(now));
    if change.calendar_name.is_some() {
        event.calendar_name.clone_from(&change.calendar_name);
    }
    MergeAction::Overwrite(event)
}

fn plan_conflict_refresh(
    existing: &UnifiedEvent,
    change: &RawEventChange,
    payload: Option<EventPayload>,
) -> MergeAction {
    let Some(candidates) = existing.conflict.as_ref() else {
        return MergeAction::Skip(SkipReason::Stale);
    };
    let remote = ConflictSide {
        payload: payload.unwrap_or_else(|| candidates.remote.payload.clone()),
        deleted: change.is_deletion(),
        modified_at: change.modified_at,
    };
    if remote.payload == candidates.remote.payload
        && remote.deleted == candidates.remote.deleted
        && change.version == candidates.remote_version
    {
        return MergeAction::Skip(SkipReason::Stale);
    }
    let mut event = existing.clone();
    if let Some(conflict) = event.conflict.as_mut() {
        conflict.remote = remote;
        conflict.remote_version.clone_from(&change.version);
    }
    MergeAction::RefreshConflict(event)
}

fn plan_pending(
    existing: &UnifiedEvent,
    change: &RawEventChange,
    payload: Option<EventPayload>,
    local_operation: OperationKind,
    now: DateTime<Utc>,
) -> MergeAction {
    if change.version.is_some() && change.version == existing.version {
        return MergeAction::Skip(SkipReason::Stale);
    }
    // Remote content still equals the acknowledged base; only its version moved.
    if let (Some(incoming), Some(base)) = (payload.as_ref(), existing.base_payload.as_ref()) {
        if incoming == base {
            if change.version == existing.version {
                return MergeAction::Skip(SkipReason::Stale);
            }
            let mut event = existing.clone();
            event.version.clone_from(&change.version);
            event.last_modified_remote = Some(change.modified_at.unwrap_or(now));
            return MergeAction::Overwrite(event);
        }
    }

    MergeAction::Detect(Box::new(ConflictInput {
        event: existing.clone(),
        local: ConflictSide {
            payload: existing.payload.clone(),
            deleted: local_operation == OperationKind::Delete,
            modified_at: existing.last_modified_local,
        },
        remote: ConflictSide {
            payload: payload.unwrap_or_else(|| existing.payload.clone()),
            deleted: change.is_deletion(),
            modified_at: change.modified_at,
        },
        remote_version: change.version.clone(),
        local_operation,
    }))
}
