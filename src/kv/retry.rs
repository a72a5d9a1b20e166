//! Shared retry policy for the coordination store: `Unavailable` is
//! retried indefinitely (subject to cancellation) with the store's
//! backoff curve; `StaleRevision` is retried up to 10 times.

use crate::config::BackoffPolicy;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};

const ELAPSED_CAP: Duration = Duration::from_secs(30);
const MAX_STALE_REVISION_RETRIES: u32 = 10;

/// Retry `op` while it returns `Unavailable`, honoring the 25ms→2s curve
/// and a 30s elapsed cap (after which the last error is returned).
pub async fn retry_unavailable<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_unavailable() && start.elapsed() < ELAPSED_CAP => {
                attempt += 1;
                let delay = BackoffPolicy::STORE_UNAVAILABLE.delay_for_attempt(attempt);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry `op` up to `MAX_STALE_REVISION_RETRIES` times while it returns
/// `StaleRevision`, with no backoff between attempts (the next attempt
/// simply re-reads the latest state).
pub async fn retry_stale_revision<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_stale_revision() && attempts < MAX_STALE_REVISION_RETRIES => {
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Compose both policies the way every repository mutation does: retry
/// transient store unavailability, and retry optimistic-txn races.
pub async fn retry_mutation<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        match retry_stale_revision(&mut op).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_unavailable() && start.elapsed() < ELAPSED_CAP => {
                attempt += 1;
                let delay = BackoffPolicy::STORE_UNAVAILABLE.delay_for_attempt(attempt);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn stale_revision_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_stale_revision(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(Error::StaleRevision("x".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stale_revision_gives_up_after_limit() {
        let result: Result<i32> =
            retry_stale_revision(|| async { Err(Error::StaleRevision("x".into())) }).await;
        assert!(result.unwrap_err().is_stale_revision());
    }

    #[tokio::test]
    async fn non_retryable_errors_pass_through_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<i32> = retry_mutation(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::BadRequest("nope".into()))
        })
        .await;
        assert!(matches!(result.unwrap_err(), Error::BadRequest(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
