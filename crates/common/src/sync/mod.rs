//! Delivery retry primitives for the offline queue and failed sync passes

pub mod retry;

pub use retry::{BackoffPolicy, RetryError, RetryResult};
