//! Bounded repeated-check waiting.
//!
//! The notebook document gives no change notification for "my write is now
//! visible", so callers poll the live resource instead. Running out of time
//! is a normal outcome reported as `false`, not an error.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::debug;

/// Number of checks that fit in `timeout` at `interval` spacing (at least one).
pub fn max_polls(interval: Duration, timeout: Duration) -> usize {
    let interval = interval.as_nanos().max(1);
    let polls = timeout.as_nanos().div_ceil(interval).max(1);
    usize::try_from(polls).unwrap_or(usize::MAX)
}

/// Evaluate `check` until it returns `Ok(true)` or the poll budget runs out.
///
/// Errors from `check` mean "not yet satisfied"; the resource may be in the
/// middle of a mutation when it is read.
pub async fn poll_until<F, Fut, E>(mut check: F, interval: Duration, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let polls = max_polls(interval, timeout);
    for poll in 0..polls {
        match check().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => debug!("[poll] Check {} of {} not ready: {}", poll + 1, polls, e),
        }
        if poll + 1 < polls {
            tokio::time::sleep(interval).await;
        }
    }
    false
}
