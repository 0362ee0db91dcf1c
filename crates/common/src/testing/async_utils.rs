//! Async testing utilities
//!
//! Helpers for waiting on background workers: polling a condition and
//! waiting for a `watch` channel to reach a state.

// Test helpers report failure through their return value
#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// Poll an async condition until it returns true or times out
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }

    false
}

/// Wait until the value in a `watch` channel satisfies `predicate`.
///
/// Returns the matching value, or `None` on timeout or when the sender was
/// dropped.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use calsync_common::testing::async_utils::wait_for_watch;
///
/// #[tokio::test]
/// async fn test_wait() {
///     let (tx, mut rx) = tokio::sync::watch::channel(0_usize);
///     tokio::spawn(async move { tx.send(3).ok() });
///     let value = wait_for_watch(&mut rx, Duration::from_secs(1), |n| *n == 3).await;
///     assert_eq!(value, Some(3));
/// }
/// ```
pub async fn wait_for_watch<T, P>(
    rx: &mut watch::Receiver<T>,
    timeout: Duration,
    mut predicate: P,
) -> Option<T>
where
    T: Clone,
    P: FnMut(&T) -> bool,
{
    tokio::time::timeout(timeout, async {
        rx.wait_for(|value| predicate(value)).await.map(|value| value.clone()).ok()
    })
    .await
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    //! Unit tests for testing::async_utils.
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_until_succeeds() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag_clone.store(true, Ordering::SeqCst);
        });

        let result = poll_until(Duration::from_secs(1), Duration::from_millis(10), || {
            let flag = flag.clone();
            async move { flag.load(Ordering::SeqCst) }
        })
        .await;

        assert!(result);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_until_times_out() {
        let result =
            poll_until(Duration::from_millis(50), Duration::from_millis(10), || async { false })
                .await;

        assert!(!result);
    }

    #[tokio::test]
    async fn test_wait_for_watch_sees_later_value() {
        let (tx, mut rx) = watch::channel(0_u32);
        tokio::spawn(async move {
            for n in 1..=4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.send(n);
            }
        });

        let seen = wait_for_watch(&mut rx, Duration::from_secs(1), |n| *n >= 4).await;
        assert_eq!(seen, Some(4));
    }

    #[tokio::test]
    async fn test_wait_for_watch_times_out() {
        let (_tx, mut rx) = watch::channel(false);
        let seen = wait_for_watch(&mut rx, Duration::from_millis(20), |flag| *flag).await;
        assert!(seen.is_none());
    }
}
