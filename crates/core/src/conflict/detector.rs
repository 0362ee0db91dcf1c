//! Structural conflict classification

use calsync_domain::{
    ConflictCandidates, ConflictConfig, ConflictSide, EventField, OperationKind,
    ResolutionStrategy, UnifiedEvent,
};
use chrono::Duration;
use tracing::debug;

/// Both sides of a divergence for one logical record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInput {
    /// Record as currently stored
    pub event: UnifiedEvent,
    pub local: ConflictSide,
    pub remote: ConflictSide,
    pub remote_version: Option<String>,
    pub local_operation: OperationKind,
}

impl ConflictInput {
    /// Rebuild the input from a record that was deferred earlier
    pub fn from_conflicted(event: &UnifiedEvent) -> Option<Self> {
        let ConflictCandidates { local, remote, local_operation, remote_version, .. } =
            event.conflict.clone()?;
        Some(Self { event: event.clone(), local, remote, remote_version, local_operation })
    }

    /// Snapshot stored on the record when the decision is deferred
    pub fn candidates(&self, detected_at: chrono::DateTime<chrono::Utc>) -> ConflictCandidates {
        ConflictCandidates {
            local: self.local.clone(),
            remote: self.remote.clone(),
            local_operation: self.local_operation,
            remote_version: self.remote_version.clone(),
            detected_at,
        }
    }
}

/// Reason both sides agree without a user decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Same content on both sides
    Identical,
    /// Both sides deleted the record
    BothDeleted,
    /// Remote content still equals the acknowledged base
    LocalAhead,
}

/// Classification of a divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    Converged(Convergence),
    Resolve(ResolutionStrategy),
    Defer,
}

/// Automatic resolution settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictPolicy {
    /// Timestamp gap below which last-writer-wins refuses to pick a side
    pub clock_skew: Duration,
    /// Strategy for edits to disjoint fields
    pub disjoint_edits: ResolutionStrategy,
    /// Strategy when one side only moved the event and the other only
    /// touched its details
    pub schedule_vs_details: ResolutionStrategy,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::from(&ConflictConfig::default())
    }
}

impl From<&ConflictConfig> for ConflictPolicy {
    fn from(config: &ConflictConfig) -> Self {
        Self {
            clock_skew: Duration::milliseconds(config.clock_skew_ms),
            disjoint_edits: config.disjoint_edits,
            schedule_vs_details: config.schedule_vs_details,
        }
    }
}

/// Decides whether a divergence can be settled automatically
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    policy: ConflictPolicy,
}

impl ConflictDetector {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Classify a divergence.
    ///
    /// With a common ancestor the decision is field-based: a field changed
    /// on both sides to different values always defers. Without one, the
    /// modification timestamps decide, and gaps inside the skew window
    /// defer.
    pub fn decide(&self, input: &ConflictInput) -> ConflictDecision {
        let decision = self.classify(input);
        debug!(logical_id = %input.event.logical_id, ?decision, "classified divergence");
        decision
    }

    fn classify(&self, input: &ConflictInput) -> ConflictDecision {
        match (input.local.deleted, input.remote.deleted) {
            (true, true) => return ConflictDecision::Converged(Convergence::BothDeleted),
            (true, false) | (false, true) => return ConflictDecision::Defer,
            (false, false) => {}
        }

        if input.local.payload == input.remote.payload {
            return ConflictDecision::Converged(Convergence::Identical);
        }

        match input.event.base_payload.as_ref() {
            Some(base) => self.classify_three_way(base, input),
            None => self.last_writer_wins(input),
        }
    }

    fn classify_three_way(
        &self,
        base: &calsync_domain::EventPayload,
        input: &ConflictInput,
    ) -> ConflictDecision {
        let local_changed = base.changed_fields(&input.local.payload);
        let remote_changed = base.changed_fields(&input.remote.payload);

        if remote_changed.is_empty() {
            return ConflictDecision::Converged(Convergence::LocalAhead);
        }
        if local_changed.is_empty() {
            return ConflictDecision::Resolve(ResolutionStrategy::KeepRemote);
        }

        let contested = local_changed
            .intersection(&remote_changed)
            .any(|field| !input.local.payload.field_equals(&input.remote.payload, *field));
        if contested {
            return ConflictDecision::Defer;
        }

        let only_schedule = |fields: &std::collections::BTreeSet<EventField>| {
            fields.iter().all(|field| field.is_schedule())
        };
        let only_details = |fields: &std::collections::BTreeSet<EventField>| {
            fields.iter().all(|field| !field.is_schedule())
        };
        let schedule_vs_details = (only_schedule(&local_changed) && only_details(&remote_changed))
            || (only_details(&local_changed) && only_schedule(&remote_changed));

        let strategy = if schedule_vs_details {
            self.policy.schedule_vs_details
        } else {
            self.policy.disjoint_edits
        };
        match strategy {
            ResolutionStrategy::Defer => ConflictDecision::Defer,
            other => ConflictDecision::Resolve(other),
        }
    }

    fn last_writer_wins(&self, input: &ConflictInput) -> ConflictDecision {
        let (Some(local_at), Some(remote_at)) = (input.local.modified_at, input.remote.modified_at)
        else {
            return ConflictDecision::Defer;
        };
        let gap = local_at - remote_at;
        if gap.abs() <= self.policy.clock_skew {
            ConflictDecision::Defer
        } else if gap > Duration::zero() {
            ConflictDecision::Resolve(ResolutionStrategy::KeepLocal)
        } else {
            ConflictDecision::Resolve(ResolutionStrategy::KeepRemote)
        }
    }
}
