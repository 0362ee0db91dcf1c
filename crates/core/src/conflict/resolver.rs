//! Turns a resolution strategy into concrete record and queue changes

use calsync_domain::{
    CalSyncError, OperationKind, QueuedOperation, ResolutionStrategy, Result, SyncStatus,
    UnifiedEvent,
};
use chrono::{DateTime, Utc};

use super::detector::{ConflictInput, Convergence};
use crate::store::identity::new_logical_id;
use crate::store::merge::promote_alias;

/// Writes that settle one divergence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionPlan {
    /// Records to insert or replace
    pub upserts: Vec<UnifiedEvent>,
    /// Logical ids to delete
    pub removals: Vec<String>,
    /// Operations to append to the offline queue
    pub enqueue: Vec<QueuedOperation>,
    /// Records whose not-yet-started operations are dropped before
    /// `enqueue` is applied
    pub cancel_pending_for: Vec<String>,
    /// Set when the record was parked for a user decision
    pub conflicted: Option<String>,
}

/// Builds [`ResolutionPlan`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Plan for a divergence where both sides already agree
    pub fn plan_converged(
        &self,
        input: &ConflictInput,
        convergence: Convergence,
        now: DateTime<Utc>,
    ) -> ResolutionPlan {
        let logical_id = input.event.logical_id.clone();
        match convergence {
            Convergence::BothDeleted => ResolutionPlan {
                removals: vec![logical_id.clone()],
                cancel_pending_for: vec![logical_id],
                ..ResolutionPlan::default()
            },
            Convergence::Identical => {
                let mut event = adopt_remote(input, now);
                event.sync_status = SyncStatus::Synced;
                ResolutionPlan {
                    upserts: vec![event],
                    cancel_pending_for: vec![logical_id],
                    ..ResolutionPlan::default()
                }
            }
            Convergence::LocalAhead => {
                let mut event = input.event.clone();
                event.version.clone_from(&input.remote_version);
                event.last_modified_remote = Some(input.remote.modified_at.unwrap_or(now));
                ResolutionPlan { upserts: vec![event], ..ResolutionPlan::default() }
            }
        }
    }

    /// Plan for an explicit strategy.
    ///
    /// `Merge` fails with `InvalidInput` when the edits overlap or a side
    /// was deleted. `KeepBoth` with a deleted side falls back to keeping the
    /// surviving side.
    pub fn plan(
        &self,
        input: &ConflictInput,
        strategy: ResolutionStrategy,
        now: DateTime<Utc>,
    ) -> Result<ResolutionPlan> {
        match strategy {
            ResolutionStrategy::KeepLocal => self.keep_local(input, now),
            ResolutionStrategy::KeepRemote => self.keep_remote(input, now),
            ResolutionStrategy::KeepBoth => self.keep_both(input, now),
            ResolutionStrategy::Merge => self.merge(input, now),
            ResolutionStrategy::Defer => self.defer(input, now),
        }
    }

    fn keep_local(&self, input: &ConflictInput, now: DateTime<Utc>) -> Result<ResolutionPlan> {
        let mut event = input.event.clone();
        event.conflict = None;
        event.payload = input.local.payload.clone();
        event.last_modified_local = Some(now);

        let kind = if input.local.deleted {
            event.version.clone_from(&input.remote_version);
            event.base_payload = Some(input.remote.payload.clone());
            OperationKind::Delete
        } else if input.remote.deleted {
            // The remote copy is gone; the local version is recreated.
            event.remote_id = None;
            event.version = None;
            event.base_payload = None;
            OperationKind::Create
        } else {
            event.version.clone_from(&input.remote_version);
            event.base_payload = Some(input.remote.payload.clone());
            OperationKind::Update
        };
        event.transition(SyncStatus::pending_for(kind))?;

        let operation = operation_for(&event, kind, now);
        Ok(ResolutionPlan {
            cancel_pending_for: vec![event.logical_id.clone()],
            upserts: vec![event],
            enqueue: vec![operation],
            ..ResolutionPlan::default()
        })
    }

    fn keep_remote(&self, input: &ConflictInput, now: DateTime<Utc>) -> Result<ResolutionPlan> {
        let logical_id = input.event.logical_id.clone();
        if input.remote.deleted {
            let mut event = input.event.clone();
            if promote_alias(&mut event) {
                event.conflict = None;
                event.transition(SyncStatus::Synced)?;
                return Ok(ResolutionPlan {
                    upserts: vec![event],
                    cancel_pending_for: vec![logical_id],
                    ..ResolutionPlan::default()
                });
            }
            return Ok(ResolutionPlan {
                removals: vec![logical_id.clone()],
                cancel_pending_for: vec![logical_id],
                ..ResolutionPlan::default()
            });
        }

        let mut event = adopt_remote(input, now);
        event.transition(SyncStatus::Synced)?;
        Ok(ResolutionPlan {
            upserts: vec![event],
            cancel_pending_for: vec![logical_id],
            ..ResolutionPlan::default()
        })
    }

    fn keep_both(&self, input: &ConflictInput, now: DateTime<Utc>) -> Result<ResolutionPlan> {
        if input.local.deleted {
            return self.keep_remote(input, now);
        }
        if input.remote.deleted {
            return self.keep_local(input, now);
        }

        let mut plan = self.keep_remote(input, now)?;

        let mut copy = UnifiedEvent::new_local(
            new_logical_id(),
            input.event.source_kind,
            input.event.calendar_id.clone(),
            input.local.payload.clone(),
            now,
        );
        copy.calendar_name.clone_from(&input.event.calendar_name);
        plan.enqueue.push(operation_for(&copy, OperationKind::Create, now));
        plan.upserts.push(copy);
        Ok(plan)
    }

    fn merge(&self, input: &ConflictInput, now: DateTime<Utc>) -> Result<ResolutionPlan> {
        if input.local.deleted || input.remote.deleted {
            return Err(CalSyncError::InvalidInput(format!(
                "{} cannot be merged: one side was deleted",
                input.event.logical_id
            )));
        }
        let base = input.event.base_payload.as_ref().ok_or_else(|| {
            CalSyncError::InvalidInput(format!(
                "{} cannot be merged: no common ancestor",
                input.event.logical_id
            ))
        })?;
        let merged = calsync_domain::EventPayload::merge_disjoint(
            base,
            &input.local.payload,
            &input.remote.payload,
        )
        .ok_or_else(|| {
            CalSyncError::InvalidInput(format!(
                "{} cannot be merged: both sides edited the same field",
                input.event.logical_id
            ))
        })?;

        if merged == input.remote.payload {
            return self.keep_remote(input, now);
        }

        let mut event = input.event.clone();
        event.conflict = None;
        event.payload = merged;
        event.base_payload = Some(input.remote.payload.clone());
        event.version.clone_from(&input.remote_version);
        event.last_modified_local = Some(now);
        event.last_modified_remote = Some(input.remote.modified_at.unwrap_or(now));
        event.transition(SyncStatus::PendingUpdate)?;

        let operation = operation_for(&event, OperationKind::Update, now);
        Ok(ResolutionPlan {
            cancel_pending_for: vec![event.logical_id.clone()],
            upserts: vec![event],
            enqueue: vec![operation],
            ..ResolutionPlan::default()
        })
    }

    fn defer(&self, input: &ConflictInput, now: DateTime<Utc>) -> Result<ResolutionPlan> {
        let mut event = input.event.clone();
        event.conflict = Some(input.candidates(now));
        event.transition(SyncStatus::Conflicted)?;
        Ok(ResolutionPlan {
            cancel_pending_for: vec![event.logical_id.clone()],
            conflicted: Some(event.logical_id.clone()),
            upserts: vec![event],
            ..ResolutionPlan::default()
        })
    }
}

fn adopt_remote(input: &ConflictInput, now: DateTime<Utc>) -> UnifiedEvent {
    let mut event = input.event.clone();
    event.conflict = None;
    event.payload = input.remote.payload.clone();
    event.base_payload = Some(input.remote.payload.clone());
    event.version.clone_from(&input.remote_version);
    event.last_modified_remote = Some(input.remote.modified_at.unwrap_or(now));
    event
}

fn operation_for(event: &UnifiedEvent, kind: OperationKind, now: DateTime<Utc>) -> QueuedOperation {
    let payload = match kind {
        OperationKind::Delete => None,
        OperationKind::Create | OperationKind::Update => Some(event.payload.clone()),
    };
    QueuedOperation::new(
        event.logical_id.clone(),
        event.source_kind,
        event.calendar_id.clone(),
        kind,
        payload,
        event.remote_id.clone(),
        now,
    )
}
