//! Unified event store service
//!
//! Every mutation of the canonical records goes through this service and is
//! serialized by a single write gate, so merge, conflict resolution and
//! delivery bookkeeping never interleave on the same record. Reads go
//! straight to the repository.

use std::collections::HashSet;
use std::sync::Arc;

use calsync_common::Clock;
use calsync_domain::{
    CalSyncError, EventPayload, OperationKind, QueuedOperation, RawEventChange, RemoteWrite,
    ResolutionStrategy, Result, SourceKind, SyncStatus, UnifiedEvent,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::identity::{is_duplicate_candidate, new_logical_id};
use super::merge::{plan_remote_change, MergeAction};
use super::ports::EventRepository;
use crate::conflict::{
    ConflictDecision, ConflictDetector, ConflictInput, ConflictResolver, ResolutionPlan,
};
use crate::queue::OfflineQueue;

/// Tally of one merge batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub aliased: usize,
    pub skipped: usize,
    /// Records that were parked for a user decision
    pub conflicts: Vec<String>,
}

impl MergeReport {
    /// Number of changes that modified the store
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.removed + self.aliased + self.conflicts.len()
    }

    pub fn absorb(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.removed += other.removed;
        self.aliased += other.aliased;
        self.skipped += other.skipped;
        self.conflicts.extend(other.conflicts);
    }
}

/// Provider acknowledgement of a delivered operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Created(RemoteWrite),
    Updated { version: Option<String> },
    Deleted,
}

/// Remote coordinates an operation is delivered against, read at dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub remote_id: Option<String>,
    pub version: Option<String>,
}

/// Single source of truth for canonical event records
pub struct UnifiedEventStore {
    events: Arc<dyn EventRepository>,
    queue: Arc<OfflineQueue>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    clock: Arc<dyn Clock>,
    write_gate: Mutex<()>,
}

impl UnifiedEventStore {
    pub fn new(
        events: Arc<dyn EventRepository>,
        queue: Arc<OfflineQueue>,
        detector: ConflictDetector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            queue,
            detector,
            resolver: ConflictResolver::new(),
            clock,
            write_gate: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get(&self, logical_id: &str) -> Result<Option<UnifiedEvent>> {
        self.events.get(logical_id).await
    }

    /// Events intersecting `[start, end)`
    pub async fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UnifiedEvent>> {
        if end <= start {
            return Err(CalSyncError::InvalidInput(format!(
                "range end {end} is not after start {start}"
            )));
        }
        self.events.in_range(start, end).await
    }

    pub async fn events_for_calendar(&self, calendar_id: &str) -> Result<Vec<UnifiedEvent>> {
        self.events.for_calendar(calendar_id).await
    }

    /// Records awaiting a user decision, each carrying both candidates
    pub async fn conflicts(&self) -> Result<Vec<UnifiedEvent>> {
        Ok(self
            .events
            .by_status(SyncStatus::Conflicted)
            .await?
            .into_iter()
            .filter(|event| event.conflict.is_some())
            .collect())
    }

    // ------------------------------------------------------------------
    // Remote changes
    // ------------------------------------------------------------------

    /// Merge one page of remote changes.
    ///
    /// Applying the same batch twice leaves the store as applying it once.
    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub async fn apply_remote_changes(
        &self,
        source: SourceKind,
        calendar_id: &str,
        changes: &[RawEventChange],
    ) -> Result<MergeReport> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.utc_now();
        let mut report = MergeReport::default();
        for change in changes {
            self.apply_change(source, change, now, &mut report).await?;
        }
        debug!(
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            aliased = report.aliased,
            skipped = report.skipped,
            conflicts = report.conflicts.len(),
            "merged remote changes"
        );
        Ok(report)
    }

    /// After a full listing, treat identities of this (source, calendar)
    /// that the provider no longer reports as remote deletions.
    #[instrument(skip(self, seen), fields(seen = seen.len()))]
    pub async fn reconcile_missing(
        &self,
        source: SourceKind,
        calendar_id: &str,
        seen: &HashSet<String>,
    ) -> Result<MergeReport> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.utc_now();
        let mut report = MergeReport::default();

        let mut missing = Vec::new();
        for event in self.events.for_source_calendar(source, calendar_id).await? {
            if event.source_kind == source && event.calendar_id == calendar_id {
                if let Some(remote_id) = event.remote_id.as_ref() {
                    if !seen.contains(remote_id) {
                        missing.push(remote_id.clone());
                    }
                }
            }
            missing.extend(
                event
                    .source_refs
                    .iter()
                    .filter(|reference| {
                        reference.source == source
                            && reference.calendar_id == calendar_id
                            && !seen.contains(&reference.remote_id)
                    })
                    .map(|reference| reference.remote_id.clone()),
            );
        }

        for remote_id in missing {
            let tombstone = RawEventChange::deleted(remote_id, calendar_id);
            self.apply_change(source, &tombstone, now, &mut report).await?;
        }
        if report.changed() > 0 {
            info!(
                removed = report.removed,
                conflicts = report.conflicts.len(),
                "reconciled full listing"
            );
        }
        Ok(report)
    }

    async fn resolve_existing(
        &self,
        source: SourceKind,
        change: &RawEventChange,
    ) -> Result<Option<UnifiedEvent>> {
        if let Some(event) = self.events.find_by_source_ref(source, &change.remote_id).await? {
            return Ok(Some(event));
        }
        let Some(payload) = change.payload() else {
            return Ok(None);
        };
        Ok(self
            .events
            .find_by_start_time(payload.start_time)
            .await?
            .into_iter()
            .find(|candidate| is_duplicate_candidate(candidate, source, &payload)))
    }

    async fn apply_change(
        &self,
        source: SourceKind,
        change: &RawEventChange,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    ) -> Result<()> {
        let existing = self.resolve_existing(source, change).await?;
        let abandoned = match existing.as_ref() {
            Some(event) if event.sync_status == SyncStatus::Failed => self
                .queue
                .abandoned_for(&event.logical_id)
                .await?
                .first()
                .map(|operation| operation.kind),
            _ => None,
        };
        match plan_remote_change(existing.as_ref(), abandoned, source, change, now) {
            MergeAction::Skip(reason) => {
                debug!(remote_id = %change.remote_id, ?reason, "change skipped");
                report.skipped += 1;
            }
            MergeAction::Insert(event) => {
                self.events.upsert(&event).await?;
                report.inserted += 1;
            }
            MergeAction::Overwrite(event)
            | MergeAction::DetachAlias(event)
            | MergeAction::RefreshConflict(event) => {
                self.events.upsert(&event).await?;
                report.updated += 1;
            }
            MergeAction::AttachAlias(event) => {
                debug!(
                    logical_id = %event.logical_id,
                    remote_id = %change.remote_id,
                    "collapsed duplicate"
                );
                self.events.upsert(&event).await?;
                report.aliased += 1;
            }
            MergeAction::Remove(logical_id) => {
                self.queue.discard_abandoned_for(&logical_id).await?;
                self.events.delete(&logical_id).await?;
                report.removed += 1;
            }
            MergeAction::Detect(input) => {
                self.settle_divergence(*input, now, report).await?;
            }
        }
        Ok(())
    }

    async fn settle_divergence(
        &self,
        input: ConflictInput,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    ) -> Result<()> {
        let plan = match self.detector.decide(&input) {
            ConflictDecision::Converged(convergence) => {
                self.resolver.plan_converged(&input, convergence, now)
            }
            ConflictDecision::Resolve(strategy) => {
                match self.resolver.plan(&input, strategy, now) {
                    Ok(plan) => plan,
                    Err(err) => {
                        warn!(
                            logical_id = %input.event.logical_id,
                            %strategy,
                            error = %err,
                            "automatic resolution not applicable, deferring"
                        );
                        self.resolver.plan(&input, ResolutionStrategy::Defer, now)?
                    }
                }
            }
            ConflictDecision::Defer => self.resolver.plan(&input, ResolutionStrategy::Defer, now)?,
        };

        match plan.conflicted.clone() {
            Some(logical_id) => {
                info!(%logical_id, "conflict deferred to user");
                report.conflicts.push(logical_id);
            }
            None if plan.upserts.is_empty() => report.removed += plan.removals.len(),
            None => report.updated += 1,
        }
        self.apply_plan(plan).await
    }

    async fn apply_plan(&self, plan: ResolutionPlan) -> Result<()> {
        // Superseded work includes what was abandoned; the plan carries the
        // local side forward.
        for logical_id in &plan.cancel_pending_for {
            self.queue.cancel_for_record(logical_id).await?;
            self.queue.discard_abandoned_for(logical_id).await?;
        }
        for logical_id in &plan.removals {
            self.events.delete(logical_id).await?;
        }
        for event in plan.upserts {
            let event = self.settle_with_in_flight(event).await?;
            self.events.upsert(&event).await?;
        }
        for operation in plan.enqueue {
            self.queue.enqueue(operation).await?;
        }
        Ok(())
    }

    /// A record marked `Synced` stays pending while an earlier delivery is
    /// still in flight.
    async fn settle_with_in_flight(&self, mut event: UnifiedEvent) -> Result<UnifiedEvent> {
        if event.sync_status == SyncStatus::Synced {
            if let Some(last) = self.queue.outstanding_for(&event.logical_id).await?.last() {
                event.sync_status = SyncStatus::pending_for(last.kind);
            }
        }
        Ok(event)
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Optimistically create an event and queue its delivery
    #[instrument(skip(self, payload), fields(title = %payload.title))]
    pub async fn apply_local_create(
        &self,
        source: SourceKind,
        calendar_id: &str,
        payload: EventPayload,
    ) -> Result<UnifiedEvent> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.utc_now();
        let event = UnifiedEvent::new_local(new_logical_id(), source, calendar_id, payload, now);
        self.events.upsert(&event).await?;
        self.queue
            .enqueue(QueuedOperation::new(
                event.logical_id.clone(),
                source,
                calendar_id,
                OperationKind::Create,
                Some(event.payload.clone()),
                None,
                now,
            ))
            .await?;
        info!(logical_id = %event.logical_id, "local create queued");
        Ok(event)
    }

    /// Optimistically replace an event's content and queue the update
    #[instrument(skip(self, payload))]
    pub async fn apply_local_update(
        &self,
        logical_id: &str,
        payload: EventPayload,
    ) -> Result<UnifiedEvent> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.utc_now();
        let mut event = self.require(logical_id).await?;
        if event.is_conflicted() {
            return Err(CalSyncError::InvalidTransition(format!(
                "{logical_id} is conflicted and must be resolved first"
            )));
        }
        self.revive_abandoned(&event).await?;
        // An undelivered create keeps its status; the update follows it.
        if event.sync_status != SyncStatus::PendingCreate {
            event.transition(SyncStatus::PendingUpdate)?;
        }
        event.payload = payload;
        event.last_modified_local = Some(now);
        self.events.upsert(&event).await?;
        self.queue
            .enqueue(QueuedOperation::new(
                event.logical_id.clone(),
                event.source_kind,
                event.calendar_id.clone(),
                OperationKind::Update,
                Some(event.payload.clone()),
                event.remote_id.clone(),
                now,
            ))
            .await?;
        info!("local update queued");
        Ok(event)
    }

    /// Delete an event.
    ///
    /// A record no provider has seen is dropped on the spot together with
    /// its queued create. Otherwise it turns `PendingDelete` and a delete is
    /// queued for the owner and for every collapsed duplicate.
    #[instrument(skip(self))]
    pub async fn apply_local_delete(&self, logical_id: &str) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.utc_now();
        let mut event = self.require(logical_id).await?;
        match event.sync_status {
            SyncStatus::PendingDelete => return Ok(()),
            SyncStatus::Conflicted => {
                return Err(CalSyncError::InvalidTransition(format!(
                    "{logical_id} is conflicted and must be resolved first"
                )));
            }
            _ => {}
        }

        if event.remote_id.is_none() && !self.queue.has_in_flight_for(logical_id).await? {
            self.queue.cancel_for_record(logical_id).await?;
            self.queue.discard_abandoned_for(logical_id).await?;
            if event.source_refs.is_empty() {
                self.events.delete(logical_id).await?;
                info!("undelivered event removed locally");
                return Ok(());
            }
        }

        self.revive_abandoned(&event).await?;
        event.transition(SyncStatus::PendingDelete)?;
        event.last_modified_local = Some(now);
        self.events.upsert(&event).await?;

        let mut operations = Vec::with_capacity(event.source_refs.len() + 1);
        if event.remote_id.is_some() || self.queue.has_in_flight_for(logical_id).await? {
            operations.push(QueuedOperation::new(
                event.logical_id.clone(),
                event.source_kind,
                event.calendar_id.clone(),
                OperationKind::Delete,
                None,
                event.remote_id.clone(),
                now,
            ));
        }
        for reference in &event.source_refs {
            operations.push(QueuedOperation::new(
                event.logical_id.clone(),
                reference.source,
                reference.calendar_id.clone(),
                OperationKind::Delete,
                None,
                Some(reference.remote_id.clone()),
                now,
            ));
        }
        for operation in operations {
            self.queue.enqueue(operation).await?;
        }
        info!("local delete queued");
        Ok(())
    }

    /// Settle a deferred conflict with the user's choice
    #[instrument(skip(self))]
    pub async fn resolve_conflict(
        &self,
        logical_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let event = self.require(logical_id).await?;
        let input = ConflictInput::from_conflicted(&event)
            .filter(|_| event.is_conflicted())
            .ok_or_else(|| CalSyncError::InvalidInput(format!("{logical_id} is not conflicted")))?;
        if strategy == ResolutionStrategy::Defer {
            return Ok(());
        }
        let plan = self.resolver.plan(&input, strategy, self.clock.utc_now())?;
        self.apply_plan(plan).await?;
        info!(%strategy, "conflict resolved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delivery bookkeeping
    // ------------------------------------------------------------------

    /// Remote identity an operation should be sent against.
    ///
    /// `None` means the target record is gone and the operation can be
    /// discarded.
    pub async fn delivery_target(
        &self,
        operation: &QueuedOperation,
    ) -> Result<Option<DeliveryTarget>> {
        let Some(event) = self.events.get(&operation.target_logical_id).await? else {
            return Ok(None);
        };
        if operation.source == event.source_kind {
            Ok(Some(DeliveryTarget {
                remote_id: event.remote_id.or_else(|| operation.remote_id.clone()),
                version: event.version,
            }))
        } else {
            Ok(Some(DeliveryTarget { remote_id: operation.remote_id.clone(), version: None }))
        }
    }

    /// Drop an operation whose record disappeared
    pub async fn discard_operation(&self, operation: &QueuedOperation) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        debug!(operation_id = %operation.operation_id, "discarding operation for missing record");
        self.queue.discard(operation).await
    }

    /// Apply a provider acknowledgement and retire the operation
    #[instrument(skip(self, operation, outcome), fields(
        operation_id = %operation.operation_id,
        logical_id = %operation.target_logical_id,
    ))]
    pub async fn record_delivery(
        &self,
        operation: &QueuedOperation,
        outcome: DeliveryOutcome,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.utc_now();
        self.queue.mark_succeeded(operation).await?;

        let Some(mut event) = self.events.get(&operation.target_logical_id).await? else {
            return Ok(());
        };
        let owner = operation.source == event.source_kind;

        match outcome {
            DeliveryOutcome::Created(write) if owner => {
                self.drop_echo(operation.source, &write.remote_id, &event.logical_id).await?;
                if event.remote_id.is_none() {
                    event.remote_id = Some(write.remote_id);
                }
                event.version = write.version;
                event.base_payload.clone_from(&operation.payload);
                event.last_modified_remote = Some(now);
            }
            DeliveryOutcome::Updated { version } if owner => {
                if version.is_some() {
                    event.version = version;
                }
                event.base_payload.clone_from(&operation.payload);
                event.last_modified_remote = Some(now);
            }
            DeliveryOutcome::Deleted => {
                let owner_copy = operation.remote_id.is_none() || operation.remote_id == event.remote_id;
                if owner && owner_copy {
                    event.remote_id = None;
                } else {
                    let remote_id = operation.remote_id.clone();
                    event.source_refs.retain(|reference| {
                        !(reference.source == operation.source
                            && Some(&reference.remote_id) == remote_id.as_ref())
                    });
                }
                if self.queue.outstanding_for(&event.logical_id).await?.is_empty() {
                    self.events.delete(&event.logical_id).await?;
                    info!("deletion confirmed");
                    return Ok(());
                }
            }
            DeliveryOutcome::Created(_) | DeliveryOutcome::Updated { .. } => {}
        }

        if !event.is_conflicted() {
            let next = match self.queue.outstanding_for(&event.logical_id).await?.last() {
                Some(latest) => SyncStatus::pending_for(latest.kind),
                None => SyncStatus::Synced,
            };
            event.transition(next)?;
        }
        self.events.upsert(&event).await?;
        debug!(status = %event.sync_status, "delivery recorded");
        Ok(())
    }

    /// Give up on an operation and flag its record
    #[instrument(skip(self, operation), fields(operation_id = %operation.operation_id))]
    pub async fn record_abandoned(
        &self,
        operation: QueuedOperation,
        error: &str,
    ) -> Result<QueuedOperation> {
        let _gate = self.write_gate.lock().await;
        let abandoned = self.queue.abandon(operation, error).await?;
        if let Some(mut event) = self.events.get(&abandoned.target_logical_id).await? {
            if !event.is_conflicted() {
                event.transition(SyncStatus::Failed)?;
                self.events.upsert(&event).await?;
            }
        }
        Ok(abandoned)
    }

    /// Requeue an abandoned operation and return its record to pending
    #[instrument(skip(self))]
    pub async fn retry_abandoned(&self, operation_id: &str) -> Result<QueuedOperation> {
        let _gate = self.write_gate.lock().await;
        let operation = self.queue.retry_abandoned(operation_id).await?;
        if let Some(mut event) = self.events.get(&operation.target_logical_id).await? {
            if event.sync_status == SyncStatus::Failed {
                event.transition(SyncStatus::pending_for(operation.kind))?;
                self.events.upsert(&event).await?;
            }
        }
        Ok(operation)
    }

    /// A sync pass may have inserted the provider's echo of a create before
    /// the create was acknowledged; the acknowledged record wins.
    async fn drop_echo(&self, source: SourceKind, remote_id: &str, logical_id: &str) -> Result<()> {
        if let Some(echo) = self.events.find_by_source_ref(source, remote_id).await? {
            if echo.logical_id != logical_id && echo.sync_status == SyncStatus::Synced {
                debug!(echo = %echo.logical_id, "dropping echo of delivered create");
                self.events.delete(&echo.logical_id).await?;
            }
        }
        Ok(())
    }

    /// A new local mutation on a failed record supersedes its abandoned
    /// updates and brings abandoned creates and deletes back so they still
    /// run first.
    async fn revive_abandoned(&self, event: &UnifiedEvent) -> Result<()> {
        if event.sync_status != SyncStatus::Failed {
            return Ok(());
        }
        for operation in self.queue.abandoned_for(&event.logical_id).await? {
            if operation.kind == OperationKind::Update {
                self.queue.discard(&operation).await?;
            } else {
                self.queue.retry_abandoned(&operation.operation_id).await?;
            }
        }
        Ok(())
    }

    async fn require(&self, logical_id: &str) -> Result<UnifiedEvent> {
        self.events
            .get(logical_id)
            .await?
            .ok_or_else(|| CalSyncError::NotFound(format!("event {logical_id}")))
    }
}

impl std::fmt::Debug for UnifiedEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedEventStore")
            .field("queue", &self.queue)
            .field("policy", self.detector.policy())
            .finish_non_exhaustive()
    }
}
