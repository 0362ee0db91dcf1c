//! Logical identity resolution
//!
//! A record's logical id is derived from the provider identity that first
//! reported it (`google:abc123`). Events created on this device get a fresh
//! time-ordered id until a provider acknowledges them. Providers that do not
//! share identifiers are matched heuristically on normalised title and start
//! time.

use calsync_domain::utils::title::normalize_title;
use calsync_domain::{EventPayload, SourceKind, SyncStatus, UnifiedEvent};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Logical id for a record first seen through `(source, remote_id)`
pub fn logical_id_for(source: SourceKind, remote_id: &str) -> String {
    format!("{source}:{remote_id}")
}

/// Fresh logical id for a record that has no provider identity yet
pub fn new_logical_id() -> String {
    format!("{}:{}", SourceKind::Local, Uuid::now_v7())
}

/// Heuristic identity of a meeting independent of the provider
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub title: String,
    pub start_time: DateTime<Utc>,
}

/// Fingerprint of a payload; `None` when the title carries no comparable
/// characters
pub fn fingerprint(payload: &EventPayload) -> Option<Fingerprint> {
    let title = normalize_title(&payload.title);
    if title.is_empty() {
        return None;
    }
    Some(Fingerprint { title, start_time: payload.start_time })
}

/// Whether `candidate` may absorb a representation from `source` carrying
/// `payload`.
///
/// Only records owned by a different source qualify, and only when that
/// source is not already aliased on the record; two events of the same
/// provider are never collapsed. Records on their way out are skipped.
pub fn is_duplicate_candidate(
    candidate: &UnifiedEvent,
    source: SourceKind,
    payload: &EventPayload,
) -> bool {
    if candidate.source_kind == source
        || candidate.source_refs.iter().any(|reference| reference.source == source)
        || candidate.sync_status == SyncStatus::PendingDelete
    {
        return false;
    }
    match (fingerprint(&candidate.payload), fingerprint(payload)) {
        (Some(existing), Some(incoming)) => existing == incoming,
        _ => false,
    }
}
