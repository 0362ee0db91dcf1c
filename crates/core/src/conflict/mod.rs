//! Conflict detection and resolution
//!
//! The detector classifies a divergence between a pending local mutation and
//! a remote change; the resolver turns a chosen strategy into a plan of
//! record writes and queue operations. Neither touches storage.

pub mod detector;
pub mod resolver;

pub use detector::{ConflictDecision, ConflictDetector, ConflictInput, ConflictPolicy, Convergence};
pub use resolver::{ConflictResolver, ResolutionPlan};
