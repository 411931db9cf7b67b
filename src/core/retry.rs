//! Bounded retry with a fixed interval.
//!
//! Both DHCP lease discovery and ssh readiness are "poll until it works or
//! the deadline passes" problems; they share this helper so the retry
//! policy lives in one place and can be exercised with tokio's paused
//! clock.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Deadline passed; carries the last observed retryable error.
    Timeout { waited: Duration, last: Option<E> },
    /// The operation failed with an error the caller does not retry.
    Fatal(E),
    /// The cancellation token fired between attempts.
    Cancelled,
}

/// Repeatedly run `op` until it succeeds, a non-retryable error occurs, the
/// deadline passes, or `cancel` fires. The first attempt happens
/// immediately; a success is returned without waiting out the interval.
pub async fn wait_for<T, E, F, Fut, R>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let started = tokio::time::Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) => {
                let waited = started.elapsed();
                if waited + policy.interval > policy.deadline {
                    return Err(RetryError::Timeout {
                        waited,
                        last: Some(err),
                    });
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
        }
    }
}
