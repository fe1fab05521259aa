use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// Linear backoff retry for transient collaborator failures
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.base_backoff.saturating_mul(attempt as u32)
    }

    /// Runs `op`, retrying only errors for which [`crate::FormError::is_transient`] holds
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(operation = what, attempt, error = %e, "Transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retries_transient_once() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        };
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = policy
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FormError::UpstreamUnavailable("timeout".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let policy = RetryPolicy::default();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = policy
            .run("broken", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FormError::Storage("constraint".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        };
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = policy
            .run("down", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FormError::UpstreamUnavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(FormError::UpstreamUnavailable(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
