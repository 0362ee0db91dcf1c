//! Optimistic local writes, delivery bookkeeping and conflict resolution

mod support;

use calsync_core::DeliveryOutcome;
use calsync_domain::{
    CalSyncError, OperationKind, OperationStatus, RawEventChange, RemoteWrite,
    ResolutionStrategy, SourceKind, SyncStatus,
};
use support::{payload, Harness};

async fn seed_synced(h: &Harness, remote_id: &str, title: &str) -> String {
    let change =
        RawEventChange::upsert(remote_id, "primary", &payload(title, 2)).with_version("v1");
    h.store.apply_remote_changes(SourceKind::Google, "primary", &[change]).await.unwrap();
    format!("google:{remote_id}")
}

#[tokio::test]
async fn local_create_is_pending_until_delivered() {
    let h = Harness::new();
    let event = h
        .store
        .apply_local_create(SourceKind::Google, "primary", payload("Lunch", 4))
        .await
        .unwrap();

    assert_eq!(event.sync_status, SyncStatus::PendingCreate);
    assert!(event.remote_id.is_none());
    assert_eq!(h.queue.pending_count(), 1);

    let operation = h.queue.outstanding_for(&event.logical_id).await.unwrap().remove(0);
    assert_eq!(operation.kind, OperationKind::Create);
    h.store
        .record_delivery(
            &operation,
            DeliveryOutcome::Created(RemoteWrite {
                remote_id: "g-new".into(),
                version: Some("v1".into()),
            }),
        )
        .await
        .unwrap();

    let delivered = h.store.get(&event.logical_id).await.unwrap().unwrap();
    assert_eq!(delivered.sync_status, SyncStatus::Synced);
    assert_eq!(delivered.remote_id.as_deref(), Some("g-new"));
    assert_eq!(delivered.base_payload.as_ref(), Some(&delivered.payload));
    assert_eq!(h.queue.pending_count(), 0);
    assert!(h.operations.all().await.is_empty(), "delivered operations are destroyed");
}

#[tokio::test]
async fn create_then_update_keeps_record_pending_until_both_land() {
    let h = Harness::new();
    let event = h
        .store
        .apply_local_create(SourceKind::Google, "primary", payload("Lunch", 4))
        .await
        .unwrap();
    h.store.apply_local_update(&event.logical_id, payload("Team lunch", 4)).await.unwrap();

    let ops = h.queue.outstanding_for(&event.logical_id).await.unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].kind, OperationKind::Create);
    assert_eq!(ops[1].kind, OperationKind::Update);

    h.store
        .record_delivery(
            &ops[0],
            DeliveryOutcome::Created(RemoteWrite { remote_id: "g9".into(), version: None }),
        )
        .await
        .unwrap();
    let mid = h.store.get(&event.logical_id).await.unwrap().unwrap();
    assert_eq!(mid.sync_status, SyncStatus::PendingUpdate);

    let target = h.store.delivery_target(&ops[1]).await.unwrap().unwrap();
    assert_eq!(target.remote_id.as_deref(), Some("g9"));
}

#[tokio::test]
async fn deleting_an_undelivered_event_drops_it_locally() {
    let h = Harness::new();
    let event = h
        .store
        .apply_local_create(SourceKind::Google, "primary", payload("Draft", 4))
        .await
        .unwrap();

    h.store.apply_local_delete(&event.logical_id).await.unwrap();

    assert!(h.store.get(&event.logical_id).await.unwrap().is_none());
    assert_eq!(h.queue.pending_count(), 0);
}

#[tokio::test]
async fn update_then_delete_are_queued_in_order() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Sync").await;

    h.store.apply_local_update(&id, payload("Sync v2", 2)).await.unwrap();
    h.store.apply_local_delete(&id).await.unwrap();

    let ops = h.queue.outstanding_for(&id).await.unwrap();
    assert_eq!(ops.iter().map(|op| op.kind).collect::<Vec<_>>(), vec![
        OperationKind::Update,
        OperationKind::Delete
    ]);
    assert!(ops[0].sequence < ops[1].sequence);
    let event = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(event.sync_status, SyncStatus::PendingDelete);
}

#[tokio::test]
async fn pending_delete_rejects_further_updates() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Sync").await;
    h.store.apply_local_delete(&id).await.unwrap();

    let err = h.store.apply_local_update(&id, payload("Too late", 2)).await.unwrap_err();
    assert!(matches!(err, CalSyncError::InvalidTransition(_)));
}

#[tokio::test]
async fn confirmed_delete_removes_record() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Sync").await;
    h.store.apply_local_delete(&id).await.unwrap();

    let op = h.queue.outstanding_for(&id).await.unwrap().remove(0);
    h.store.record_delivery(&op, DeliveryOutcome::Deleted).await.unwrap();

    assert!(h.store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn remote_delete_against_pending_update_then_keep_local_recreates() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Quarterly").await;
    h.store.apply_local_update(&id, payload("Quarterly (agenda)", 2)).await.unwrap();

    h.store
        .apply_remote_changes(
            SourceKind::Google,
            "primary",
            &[RawEventChange::deleted("g1", "primary")],
        )
        .await
        .unwrap();

    let conflicted = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(conflicted.sync_status, SyncStatus::Conflicted);
    assert!(conflicted.conflict.as_ref().unwrap().remote.deleted);

    h.store.resolve_conflict(&id, ResolutionStrategy::KeepLocal).await.unwrap();

    let resolved = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::PendingCreate);
    assert!(resolved.remote_id.is_none());
    assert!(resolved.conflict.is_none());
    let ops = h.queue.outstanding_for(&id).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Create);
    assert_eq!(ops[0].payload.as_ref().unwrap().title, "Quarterly (agenda)");
}

#[tokio::test]
async fn keep_remote_discards_local_edit() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Plan").await;
    h.store.apply_local_update(&id, payload("Plan (local)", 2)).await.unwrap();
    h.store
        .apply_remote_changes(
            SourceKind::Google,
            "primary",
            &[RawEventChange::upsert("g1", "primary", &payload("Plan (remote)", 2)).with_version("v2")],
        )
        .await
        .unwrap();

    h.store.resolve_conflict(&id, ResolutionStrategy::KeepRemote).await.unwrap();

    let event = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(event.sync_status, SyncStatus::Synced);
    assert_eq!(event.payload.title, "Plan (remote)");
    assert_eq!(h.queue.pending_count(), 0);
}

#[tokio::test]
async fn resolving_a_record_that_is_not_conflicted_fails() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Plan").await;
    let err = h.store.resolve_conflict(&id, ResolutionStrategy::KeepLocal).await.unwrap_err();
    assert!(matches!(err, CalSyncError::InvalidInput(_)));
}

#[tokio::test]
async fn abandoned_operation_fails_record_and_can_be_retried() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Plan").await;
    h.store.apply_local_delete(&id).await.unwrap();
    let op = h.queue.outstanding_for(&id).await.unwrap().remove(0);

    let abandoned = h.store.record_abandoned(op, "network unreachable").await.unwrap();
    assert_eq!(abandoned.status, OperationStatus::Abandoned);
    assert_eq!(h.store.get(&id).await.unwrap().unwrap().sync_status, SyncStatus::Failed);
    assert_eq!(h.queue.abandoned().await.unwrap().len(), 1);
    assert_eq!(h.queue.pending_count(), 0);

    let retried = h.store.retry_abandoned(&abandoned.operation_id).await.unwrap();
    assert_eq!(retried.status, OperationStatus::Pending);
    assert_eq!(retried.attempt_count, 0);
    assert_eq!(h.store.get(&id).await.unwrap().unwrap().sync_status, SyncStatus::PendingDelete);
    assert_eq!(h.queue.pending_count(), 1);
}

#[tokio::test]
async fn failed_update_survives_an_unchanged_remote_replay() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Plan").await;
    h.store.apply_local_update(&id, payload("Plan (local)", 2)).await.unwrap();
    let op = h.queue.outstanding_for(&id).await.unwrap().remove(0);
    h.store.record_abandoned(op, "server rejected").await.unwrap();

    let replay = RawEventChange::upsert("g1", "primary", &payload("Plan", 2)).with_version("v1");
    let report =
        h.store.apply_remote_changes(SourceKind::Google, "primary", &[replay]).await.unwrap();
    assert_eq!(report.skipped, 1);

    let event = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(event.sync_status, SyncStatus::Failed);
    assert_eq!(event.payload.title, "Plan (local)");
    let abandoned = h.queue.abandoned().await.unwrap();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].payload.as_ref().map(|p| p.title.as_str()), Some("Plan (local)"));

    h.store.retry_abandoned(&abandoned[0].operation_id).await.unwrap();
    let event = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(event.sync_status, SyncStatus::PendingUpdate);
    assert_eq!(event.payload.title, "Plan (local)");
}

#[tokio::test]
async fn failed_update_meeting_a_remote_edit_becomes_a_conflict() {
    let h = Harness::new();
    let id = seed_synced(&h, "g1", "Plan").await;
    h.store.apply_local_update(&id, payload("Plan (local)", 2)).await.unwrap();
    let op = h.queue.outstanding_for(&id).await.unwrap().remove(0);
    h.store.record_abandoned(op, "server rejected").await.unwrap();

    let edit =
        RawEventChange::upsert("g1", "primary", &payload("Plan (remote)", 2)).with_version("v2");
    let report =
        h.store.apply_remote_changes(SourceKind::Google, "primary", &[edit]).await.unwrap();
    assert_eq!(report.conflicts, vec![id.clone()]);

    let event = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(event.sync_status, SyncStatus::Conflicted);
    let candidates = event.conflict.as_ref().unwrap();
    assert_eq!(candidates.local.payload.title, "Plan (local)");
    assert_eq!(candidates.remote.payload.title, "Plan (remote)");
    assert_eq!(candidates.local_operation, OperationKind::Update);
    assert!(h.queue.abandoned().await.unwrap().is_empty());

    h.store.resolve_conflict(&id, ResolutionStrategy::KeepLocal).await.unwrap();
    let queued = h.queue.outstanding_for(&id).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, OperationKind::Update);
    assert_eq!(queued[0].payload.as_ref().map(|p| p.title.as_str()), Some("Plan (local)"));
    let event = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(event.sync_status, SyncStatus::PendingUpdate);
    assert_eq!(event.version.as_deref(), Some("v2"));
}

#[tokio::test]
async fn echo_of_a_create_is_folded_into_the_local_record() {
    let h = Harness::new();
    let event = h
        .store
        .apply_local_create(SourceKind::Google, "primary", payload("Offsite", 6))
        .await
        .unwrap();
    let op = h.queue.outstanding_for(&event.logical_id).await.unwrap().remove(0);
    let op = h.queue.mark_in_flight(op).await.unwrap();

    // A sync pass sees the provider's copy before the create is acknowledged.
    h.store
        .apply_remote_changes(
            SourceKind::Google,
            "primary",
            &[RawEventChange::upsert("g-echo", "primary", &payload("Offsite", 6))],
        )
        .await
        .unwrap();
    assert_eq!(h.events.len().await, 2);

    h.store
        .record_delivery(
            &op,
            DeliveryOutcome::Created(RemoteWrite { remote_id: "g-echo".into(), version: None }),
        )
        .await
        .unwrap();

    assert_eq!(h.events.len().await, 1);
    let delivered = h.store.get(&event.logical_id).await.unwrap().unwrap();
    assert_eq!(delivered.remote_id.as_deref(), Some("g-echo"));
}
