// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff.
//!
//! Presets:
//! - [`RetryConfig::startup()`]: pool connection at engine start, fails fast
//! - [`RetryConfig::query()`]: a few quick attempts around one operation
//! - [`RetryConfig::lock()`]: pacing between lock acquisition attempts
//!
//! ```
//! use tiered_orm::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! let lock = RetryConfig::lock();
//! assert_eq!(lock.max_retries, None);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries until the caller gives up some other way.
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Five attempts, 200ms doubling to 2s.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Three attempts, 100ms doubling to 2s.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Unbounded schedule; the locker stops at its wait deadline.
    #[must_use]
    pub fn lock() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            factor: 1.5,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Successive delays of this schedule.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut delay = self.initial_delay;
        let mut produced = 0usize;
        std::iter::from_fn(move || {
            if self.max_retries.is_some_and(|max| produced + 1 >= max) {
                return None;
            }
            produced += 1;
            let current = delay;
            delay = delay.mul_f64(self.factor).min(self.max_delay);
            Some(current)
        })
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = config.delays();
    let mut attempts = 0usize;

    loop {
        match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                attempts += 1;
                let Some(delay) = delays.next() else {
                    return Err(err);
                };
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    error = %err,
                    retry_in = ?delay,
                    "operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();

        let result: Result<i32, String> = retry("test_op", &RetryConfig::test(), || {
            let a = seen.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(format!("fail {count}"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();

        let result: Result<i32, String> = retry("test_op", &RetryConfig::test(), || {
            let a = seen.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err("always fail".to_string())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "always fail");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            factor: 2.0,
            max_retries: Some(5),
        };
        let delays: Vec<_> = config.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_lock_schedule_is_unbounded() {
        assert_eq!(RetryConfig::lock().delays().take(50).count(), 50);
    }
}
