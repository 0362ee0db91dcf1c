//! Offline queue operation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{EventPayload, SourceKind};
use crate::constants::MAX_ERROR_LENGTH;

/// Kind of local mutation waiting for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

crate::impl_domain_status_conversions!(OperationKind {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Succeeded,
    Abandoned,
}

crate::impl_domain_status_conversions!(OperationStatus {
    Pending => "pending",
    InFlight => "in_flight",
    Succeeded => "succeeded",
    Abandoned => "abandoned",
});

/// One pending local mutation.
///
/// The queue references the target record by logical id only. The payload
/// is a snapshot taken at enqueue time so the mutation can be replayed
/// without reading the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub operation_id: String,
    /// Assigned on insert; FIFO order across the whole queue
    pub sequence: i64,
    pub target_logical_id: String,
    pub source: SourceKind,
    pub calendar_id: String,
    pub kind: OperationKind,
    pub payload: Option<EventPayload>,
    /// Remote id known at enqueue time (absent for creates)
    pub remote_id: Option<String>,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedOperation {
    /// New pending operation with a time-ordered id.
    pub fn new(
        target_logical_id: impl Into<String>,
        source: SourceKind,
        calendar_id: impl Into<String>,
        kind: OperationKind,
        payload: Option<EventPayload>,
        remote_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id: Uuid::now_v7().to_string(),
            sequence: 0,
            target_logical_id: target_logical_id.into(),
            source,
            calendar_id: calendar_id.into(),
            kind,
            payload,
            remote_id,
            attempt_count: 0,
            next_retry_at: None,
            status: OperationStatus::Pending,
            last_error: None,
            created_at: now,
        }
    }

    /// Key handed to providers that deduplicate creates.
    pub fn idempotency_key(&self) -> &str {
        &self.operation_id
    }

    /// Pending and past its retry time.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Store an error message, truncated on a char boundary.
    pub fn set_error(&mut self, message: &str) {
        self.last_error = Some(truncate_error(message));
    }
}

pub(crate) fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LENGTH {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LENGTH;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn op(now: DateTime<Utc>) -> QueuedOperation {
        QueuedOperation::new(
            "local:1",
            SourceKind::Google,
            "primary",
            OperationKind::Delete,
            None,
            Some("g-1".into()),
            now,
        )
    }

    #[test]
    fn new_operation_is_ready_immediately() {
        let now = Utc::now();
        let op = op(now);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt_count, 0);
        assert!(op.is_ready(now));
        assert_eq!(op.idempotency_key(), op.operation_id);
    }

    #[test]
    fn scheduled_retry_is_not_ready_early() {
        let now = Utc::now();
        let mut op = op(now);
        op.next_retry_at = Some(now + Duration::seconds(4));

        assert!(!op.is_ready(now));
        assert!(op.is_ready(now + Duration::seconds(4)));
    }

    #[test]
    fn in_flight_is_never_ready() {
        let now = Utc::now();
        let mut op = op(now);
        op.status = OperationStatus::InFlight;
        assert!(!op.is_ready(now));
    }

    #[test]
    fn long_errors_are_truncated_on_char_boundary() {
        let mut op = op(Utc::now());
        let message = "é".repeat(MAX_ERROR_LENGTH);
        op.set_error(&message);

        let stored = op.last_error.unwrap();
        assert!(stored.len() <= MAX_ERROR_LENGTH);
        assert!(stored.chars().all(|c| c == 'é'));
    }

    #[test]
    fn status_text_round_trip() {
        assert_eq!(OperationStatus::InFlight.to_string(), "in_flight");
        assert_eq!("abandoned".parse::<OperationStatus>().unwrap(), OperationStatus::Abandoned);
        assert_eq!("UPDATE".parse::<OperationKind>().unwrap(), OperationKind::Update);
    }
}
