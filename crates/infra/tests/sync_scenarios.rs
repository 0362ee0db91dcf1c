//! End-to-end sync scenarios against an in-memory provider.

mod support;

use std::sync::Arc;
use std::time::Duration;

use calsync_common::testing::wait_for_watch;
use calsync_core::CursorRepository;
use calsync_domain::{
    ConnectivityState, EngineAlert, OperationStatus, ResolutionStrategy, SourceError, SourceKind,
    SyncStatus,
};
use calsync_infra::SqliteCursorRepository;
use support::{build_engine, meeting, sync_and_wait, wait_until, FakeProvider, CALENDAR};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread")]
async fn offline_create_is_delivered_once_back_online() {
    let dir = TempDir::new().unwrap();
    let google = Arc::new(FakeProvider::new(SourceKind::Google));
    let engine = build_engine(&dir, &[google.clone()], ConnectivityState::Offline);
    engine.start().await.unwrap();

    let created = engine
        .create_event(SourceKind::Google, CALENDAR, meeting("Standup", 9))
        .await
        .unwrap();
    assert_eq!(created.sync_status, SyncStatus::PendingCreate);
    assert_eq!(engine.pending_count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(google.call_count("create").await, 0, "nothing is sent while offline");

    let mut pending = engine.queue().subscribe_pending_count();
    assert!(engine.set_online(true));
    let drained = wait_for_watch(&mut pending, Duration::from_secs(5), |count| *count == 0).await;
    assert_eq!(drained, Some(0), "queue did not drain after reconnecting");

    let engine_ref = &engine;
    let id = created.logical_id.clone();
    let delivered = wait_until(move || {
        let id = id.clone();
        async move {
            engine_ref
                .get_event(&id)
                .await
                .unwrap()
                .is_some_and(|event| event.sync_status == SyncStatus::Synced)
        }
    })
    .await;
    assert!(delivered, "create was not delivered after reconnecting");

    let event = engine.get_event(&created.logical_id).await.unwrap().unwrap();
    assert_eq!(event.remote_id.as_deref(), Some("google-1"));
    assert_eq!(google.call_count("create").await, 1);
    assert_eq!(google.remote_ids().await, vec!["google-1".to_string()]);

    // The reconnect sync echoes the created event back without a duplicate.
    sync_and_wait(&engine, &[SourceKind::Google]).await;
    assert_eq!(engine.events_for_calendar(CALENDAR).await.unwrap().len(), 1);
    assert_eq!(engine.pending_count(), 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_edit_against_remote_delete_is_deferred_then_recreated() {
    let dir = TempDir::new().unwrap();
    let google = Arc::new(FakeProvider::new(SourceKind::Google));
    google.remote_upsert("g1", meeting("Planning", 10)).await;
    let engine = build_engine(&dir, &[google.clone()], ConnectivityState::Online);

    sync_and_wait(&engine, &[SourceKind::Google]).await;
    let synced = engine.get_event("google:g1").await.unwrap().unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);

    let edited = meeting("Planning", 10).with_location("Room 4");
    engine.update_event("google:g1", edited.clone()).await.unwrap();
    google.remote_delete("g1").await;
    sync_and_wait(&engine, &[SourceKind::Google]).await;

    let conflicted = engine.get_event("google:g1").await.unwrap().unwrap();
    assert_eq!(conflicted.sync_status, SyncStatus::Conflicted);
    let candidates = conflicted.conflict.as_ref().unwrap();
    assert!(candidates.remote.deleted);
    assert_eq!(candidates.local.payload, edited);
    assert_eq!(engine.conflicts().await.unwrap().len(), 1);
    assert_eq!(engine.pending_count(), 0, "queued update is cancelled");

    engine.resolve_conflict("google:g1", ResolutionStrategy::KeepLocal).await.unwrap();
    let recreating = engine.get_event("google:g1").await.unwrap().unwrap();
    assert_eq!(recreating.sync_status, SyncStatus::PendingCreate);
    assert!(recreating.remote_id.is_none());

    let report = engine.drain().await.unwrap();
    assert_eq!(report.delivered, 1);
    let recreated = engine.get_event("google:g1").await.unwrap().unwrap();
    assert_eq!(recreated.sync_status, SyncStatus::Synced);
    assert_eq!(recreated.remote_id.as_deref(), Some("google-1"));
    assert_eq!(google.remote_event("google-1").await, Some(edited));
    assert_eq!(google.call_count("update").await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn same_meeting_from_two_providers_collapses_into_one_record() {
    let dir = TempDir::new().unwrap();
    let google = Arc::new(FakeProvider::new(SourceKind::Google));
    let microsoft = Arc::new(FakeProvider::new(SourceKind::Microsoft));
    google.remote_upsert("g1", meeting("Quarterly Review", 15)).await;
    microsoft.remote_upsert("m1", meeting("  quarterly review ", 15)).await;
    microsoft.remote_upsert("m2", meeting("Dentist", 8)).await;
    let engine = build_engine(&dir, &[google, microsoft], ConnectivityState::Online);

    sync_and_wait(&engine, &[SourceKind::Google]).await;
    sync_and_wait(&engine, &[SourceKind::Microsoft]).await;

    let events = engine.events_for_calendar(CALENDAR).await.unwrap();
    assert_eq!(events.len(), 2);
    let review = engine.get_event("google:g1").await.unwrap().unwrap();
    assert_eq!(review.source_refs.len(), 1);
    assert_eq!(review.source_refs[0].source, SourceKind::Microsoft);
    assert_eq!(review.source_refs[0].remote_id, "m1");
    assert!(engine.get_event("microsoft:m2").await.unwrap().is_some());

    // A second pass does not alias again.
    sync_and_wait(&engine, &[SourceKind::Google, SourceKind::Microsoft]).await;
    let review = engine.get_event("google:g1").await.unwrap().unwrap();
    assert_eq!(review.source_refs.len(), 1);
    assert_eq!(engine.events_for_calendar(CALENDAR).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_cursor_triggers_full_resync_and_reconciles_deletions() {
    let dir = TempDir::new().unwrap();
    let google = Arc::new(FakeProvider::new(SourceKind::Google));
    google.remote_upsert("g1", meeting("Standup", 9)).await;
    google.remote_upsert("g2", meeting("Lunch", 12)).await;
    let engine = build_engine(&dir, &[google.clone()], ConnectivityState::Online);
    let cursors = SqliteCursorRepository::new(Arc::clone(engine.database()));

    sync_and_wait(&engine, &[SourceKind::Google]).await;
    google.remote_upsert("g3", meeting("Retro", 16)).await;
    sync_and_wait(&engine, &[SourceKind::Google]).await;
    let cursor = cursors.get(SourceKind::Google, CALENDAR).await.unwrap().unwrap();
    assert_eq!(cursor.token.as_deref(), Some("c3"));
    assert_eq!(engine.events_for_calendar(CALENDAR).await.unwrap().len(), 3);

    google.remote_delete("g2").await;
    google
        .script_fetches([Some(SourceError::CursorInvalid("sync token expired".into()))])
        .await;
    sync_and_wait(&engine, &[SourceKind::Google]).await;

    assert!(engine.get_event("google:g2").await.unwrap().is_none());
    assert!(engine.get_event("google:g1").await.unwrap().is_some());
    assert!(engine.get_event("google:g3").await.unwrap().is_some());

    let cursor = cursors.get(SourceKind::Google, CALENDAR).await.unwrap().unwrap();
    assert_eq!(cursor.token.as_deref(), Some("c4"));
    assert_eq!(cursor.invalidation_count, 1);
    assert!(cursor.last_successful_sync_at.is_some());
    assert_eq!(
        google.calls().await,
        vec!["fetch:-", "fetch:c2", "fetch:c3", "fetch:-"],
    );

    // The re-established cursor is used incrementally and clears the streak.
    sync_and_wait(&engine, &[SourceKind::Google]).await;
    let cursor = cursors.get(SourceKind::Google, CALENDAR).await.unwrap().unwrap();
    assert_eq!(cursor.invalidation_count, 0);
    assert_eq!(google.calls().await.last().map(String::as_str), Some("fetch:c4"));
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_delete_is_abandoned_and_can_be_retried() {
    let dir = TempDir::new().unwrap();
    let google = Arc::new(FakeProvider::new(SourceKind::Google));
    google.remote_upsert("g1", meeting("Offsite", 11)).await;
    let engine = build_engine(&dir, &[google.clone()], ConnectivityState::Online);
    sync_and_wait(&engine, &[SourceKind::Google]).await;

    google
        .fail_deletes((0..6).map(|_| SourceError::NetworkUnreachable("connection reset".into())))
        .await;
    let mut alerts = engine.alerts();
    engine.start().await.unwrap();
    engine.delete_event("google:g1").await.unwrap();

    let engine_ref = &engine;
    let abandoned = wait_until(move || async move {
        !engine_ref.abandoned_operations().await.unwrap().is_empty()
    })
    .await;
    assert!(abandoned, "delete was never abandoned");

    let operations = engine.abandoned_operations().await.unwrap();
    assert_eq!(operations.len(), 1);
    let operation = &operations[0];
    assert_eq!(operation.attempt_count, 6);
    assert_eq!(operation.status, OperationStatus::Abandoned);
    assert!(operation.last_error.as_deref().unwrap_or_default().contains("connection reset"));

    let event = engine.get_event("google:g1").await.unwrap().unwrap();
    assert_eq!(event.sync_status, SyncStatus::Failed);
    assert_eq!(engine.pending_count(), 0);

    let alert = tokio::time::timeout(Duration::from_secs(1), alerts.recv()).await.unwrap().unwrap();
    assert!(matches!(
        alert,
        EngineAlert::OperationAbandoned { ref logical_id, .. } if logical_id == "google:g1"
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(google.call_count("delete").await, 6, "abandoned operations are not retried");

    let requeued = engine.retry_operation(&operation.operation_id).await.unwrap();
    assert_eq!(requeued.attempt_count, 0);
    let removed = wait_until(move || async move {
        engine_ref.get_event("google:g1").await.unwrap().is_none()
    })
    .await;
    assert!(removed, "retried delete was not delivered");
    assert!(google.remote_event("g1").await.is_none());
    assert_eq!(google.call_count("delete").await, 7);
    assert!(engine.abandoned_operations().await.unwrap().is_empty());

    engine.shutdown().await.unwrap();
}
