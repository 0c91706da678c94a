//! Guarded execution of notebook operations.
//!
//! `run_guarded` is the only retry loop in the crate. Operation bodies call
//! `ensure_connected`/`ensure_alive` themselves and raise plainly; this
//! module classifies each failure through the [`BackoffPolicy`] and either
//! sleeps and retries, or surfaces the error.

use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backoff::{BackoffPolicy, RetryDecision};
use crate::error::RelayError;

/// Operation category, used to pick a named retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    /// Retried after a dropped connection. A drop after the edit was sent can
    /// hide an edit the host applied, so write bodies check for it first.
    Write,
    /// Never re-run: a retry would execute the cell twice.
    Execute,
}

/// One failed attempt, as logged.
#[derive(Debug, Clone)]
pub struct OperationAttempt {
    /// 0-based.
    pub attempt: usize,
    pub elapsed: Duration,
    pub error: String,
}

/// Run `body` under `policy`, retrying transient connection failures.
pub async fn run_guarded<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut body: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        let err = match body().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        "[guarded] {} succeeded after {} retr{}",
                        label,
                        attempt,
                        if attempt == 1 { "y" } else { "ies" }
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let record = OperationAttempt {
            attempt,
            elapsed: started.elapsed(),
            error: err.to_string(),
        };

        match policy.should_retry(attempt, &err) {
            RetryDecision::Retry { delay } => {
                warn!(
                    "[guarded] {} attempt {}/{} failed after {:?}: {}. Retrying in {:?}",
                    label,
                    record.attempt + 1,
                    policy.max_attempts,
                    record.elapsed,
                    record.error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            RetryDecision::Exhausted => {
                error!(
                    "[guarded] {} gave up after {} attempt{} ({:?}): {}",
                    label,
                    record.attempt + 1,
                    if record.attempt == 0 { "" } else { "s" },
                    record.elapsed,
                    record.error
                );
                return Err(RelayError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }
            RetryDecision::Fatal => {
                info!("[guarded] {} failed: {}", label, record.error);
                return Err(err);
            }
        }
    }
}
