//! Unified event store: canonical records and the rules for changing them

pub mod identity;
pub mod merge;
pub mod ports;
pub mod service;

pub use merge::{plan_remote_change, MergeAction, SkipReason};
pub use ports::EventRepository;
pub use service::{DeliveryOutcome, DeliveryTarget, MergeReport, UnifiedEventStore};
