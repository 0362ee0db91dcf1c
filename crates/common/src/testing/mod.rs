//! Testing utilities and helpers
//!
//! - **[`async_utils`]**: waiting on background tasks and watch channels
//! - **[`time`]**: the [`Clock`] abstraction with a controllable
//!   [`MockClock`]
//!
//! [`time`] is also used in production through [`SystemClock`].

pub mod async_utils;
pub mod time;

pub use async_utils::{poll_until, wait_for_watch};
pub use time::{Clock, MockClock, SystemClock};
