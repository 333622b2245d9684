//! Bounded retry with exponential backoff for the persistence boundary.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::StorageConfig;
use crate::{MemoryError, MemoryResult};

/// Retry policy applied to storage operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Delay before the given retry (1-based), doubled per attempt with up to 25% jitter
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(10));
        let jitter_ms = if base.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4)
        };
        base + Duration::from_millis(jitter_ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// Exhausted transient failures surface as `StorageFailure`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> MemoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempt >= self.max_attempts {
                        tracing::error!(operation, attempt, "storage retries exhausted: {}", err);
                        return Err(MemoryError::StorageFailure {
                            operation: operation.to_string(),
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    tracing::warn!(operation, attempt, ?delay, "transient storage error: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&StorageConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> MemoryError {
        MemoryError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&StorageConfig {
            max_attempts,
            base_delay_ms: 1,
        })
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast_policy(3)
            .run("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_storage_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: MemoryResult<()> = fast_policy(2)
            .run("insert", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(busy())
            })
            .await;

        match result {
            Err(MemoryError::StorageFailure { operation, attempts, .. }) => {
                assert_eq!(operation, "insert");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected StorageFailure, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_non_retryable_errors_pass_through() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: MemoryResult<()> = tokio_test::block_on(fast_policy(5).run("get", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MemoryError::not_found("MemoryRecord", "x"))
        }));

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
