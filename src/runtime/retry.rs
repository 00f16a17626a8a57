//! Bounded-backoff retry for runtime operations
//!
//! Retry policy is centralized here so the container runtime
//! implementations stay retry-free and the policy is inspectable in
//! one place.

use crate::utils::errors::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy applied by state machine and monitor when calling the runtime
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first failure
    pub max_retries: u32,

    /// Initial backoff, doubled per attempt with jitter
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// No retries, for teardown paths that must not stall
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Non-transient errors (capacity, ownership, lifecycle, timeouts) are
/// returned immediately: they are synchronous failures of the triggering
/// call, never retried here.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let exp = policy.backoff.saturating_mul(1 << attempt.min(16));
                let jitter = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 4);
                let delay = exp + Duration::from_millis(jitter);
                warn!(
                    operation = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::HubError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result = with_retry(policy, "stats", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(HubError::HandleUnreachable("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<()> = with_retry(policy, "pause", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HubError::NotOwner("inst_1".into())) }
        })
        .await;

        assert!(matches!(result.unwrap_err(), HubError::NotOwner(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: Result<()> = with_retry(policy, "stats", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HubError::HandleUnreachable("down".into())) }
        })
        .await;

        assert!(matches!(result.unwrap_err(), HubError::HandleUnreachable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
