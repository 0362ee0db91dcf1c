// Retry module: exponential backoff with additive jitter and an attempt budget

pub mod constants;
pub mod error;
pub mod policy;

pub use error::{RetryError, RetryResult};
pub use policy::BackoffPolicy;
