//! Modular common utilities shared across CalSync crates.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: backoff policy and its errors
//! - `runtime`: async helpers and the clock abstraction

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod sync;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "runtime", feature = "test-utils", test))]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use sync::retry::{BackoffPolicy, RetryError, RetryResult};
#[cfg(any(feature = "runtime", feature = "test-utils", test))]
pub use testing::time::{Clock, MockClock, SystemClock};
