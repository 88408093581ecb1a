//! Bounded retry for transient ledger failures

use crate::config::LedgerConfig;
use crate::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry; doubled each time
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Policy from ledger config
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            max_retries: config.max_transient_retries,
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Run `op`, retrying only transient failures
///
/// Non-transient errors (including `InsufficientBalance`) are returned on
/// the first occurrence.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying: {}", e);
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
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = retry_transient(&fast_policy(3), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::TransientStore("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<()> = retry_transient(&fast_policy(2), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::TransientStore("busy".into()))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_business_errors() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<()> = retry_transient(&fast_policy(5), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidRequest("amount must be positive".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
