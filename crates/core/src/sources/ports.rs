//! Port interface every calendar provider integration implements
//!
//! Adapters translate provider APIs into the engine's vocabulary. Every call
//! reports a typed [`SourceError`] so callers can tell transient failures
//! from authentication, conflict and permanent rejections.

use async_trait::async_trait;
use calsync_domain::{
    CalendarInfo, ChangePage, EventPayload, ProviderCapabilities, RemoteWrite, SourceError,
    SourceKind,
};
use chrono::{DateTime, Utc};

/// Result type returned by adapter calls
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Contract for a calendar provider integration
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Which source this adapter speaks for
    fn kind(&self) -> SourceKind;

    /// Features the provider supports
    fn capabilities(&self) -> ProviderCapabilities;

    /// Calendars visible to the signed-in account
    async fn list_calendars(&self) -> SourceResult<Vec<CalendarInfo>>;

    /// Fetch changes since `cursor`.
    ///
    /// `None` requests a full listing. When the returned page has
    /// `has_more`, the caller fetches again with the page's `next_cursor`
    /// before persisting anything.
    async fn fetch_changes(
        &self,
        calendar_id: &str,
        cursor: Option<&str>,
    ) -> SourceResult<ChangePage>;

    /// Create an event; `idempotency_key` is only passed to providers that
    /// declare support for it.
    async fn create_remote(
        &self,
        calendar_id: &str,
        payload: &EventPayload,
        idempotency_key: Option<&str>,
    ) -> SourceResult<RemoteWrite>;

    /// Replace an event's content, returning the provider's new version.
    async fn update_remote(
        &self,
        calendar_id: &str,
        remote_id: &str,
        payload: &EventPayload,
        expected_version: Option<&str>,
    ) -> SourceResult<Option<String>>;

    /// Delete an event. `Ok(false)` means the event was already gone.
    async fn delete_remote(&self, calendar_id: &str, remote_id: &str) -> SourceResult<bool>;

    /// Renew the push-notification channel, returning its new expiry
    async fn renew_push_subscription(&self) -> SourceResult<DateTime<Utc>>;
}
