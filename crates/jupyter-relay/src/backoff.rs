//! Retry decisions for remote calls.
//!
//! Only dropped connections are retried. They are recognised by a small set
//! of disconnect phrases in the error message, matched case-insensitively.
//! Delays grow linearly (`base_delay + step * attempt`) since peers usually
//! reconnect within a few seconds.

use std::time::Duration;

use crate::error::RelayError;

/// Disconnect phrases, lowercase.
const TRANSIENT_PHRASES: &[&str] = &[
    "websocketclosederror",
    "websocket closed",
    "socket closed",
    "connection is already closed",
    "connection closed",
];

/// Check whether an error message describes a dropped connection.
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

/// Outcome of classifying one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then run the operation again.
    Retry { delay: Duration },
    /// Transient failure, but the attempt budget is spent.
    Exhausted,
    /// Not a connectivity problem; surface immediately.
    Fatal,
}

/// Bounded linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(1))
    }
}

impl BackoffPolicy {
    pub const fn new(max_attempts: usize, base_delay: Duration, step: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            step,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_add(self.step.saturating_mul(attempt))
    }

    /// Decide what to do after attempt `attempt` (0-based) failed with `error`.
    pub fn should_retry(&self, attempt: usize, error: &RelayError) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::Fatal;
        }
        if attempt + 1 < self.max_attempts {
            RetryDecision::Retry {
                delay: self.delay_for(attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}
