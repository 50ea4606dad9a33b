//! Bounded retry with exponential backoff.
//!
//! The delay before retry `n` (0-indexed) is `base_delay * 2^n`, capped at
//! `max_delay`. Errors matched by `ignore_if` are retried without
//! consuming the attempt budget; errors rejected by `retry_if` fail
//! immediately.

use std::future::Future;
use std::time::Duration;

use crate::constants::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryOptions {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

type Predicate<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;

pub struct Retry<'a, E> {
    options: RetryOptions,
    retry_if: Predicate<'a, E>,
    ignore_if: Option<Predicate<'a, E>>,
}

impl<'a, E: std::fmt::Display> Retry<'a, E> {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            retry_if: Box::new(|_| true),
            ignore_if: None,
        }
    }

    /// Only errors matching `pred` are retried; others are returned at once.
    pub fn retry_if(mut self, pred: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.retry_if = Box::new(pred);
        self
    }

    /// Errors matching `pred` are retried without counting as an attempt.
    pub fn ignore_if(mut self, pred: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.ignore_if = Some(Box::new(pred));
        self
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.options.attempts.max(1);
        let mut failed = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.ignore_if.as_ref().is_some_and(|ignore| ignore(&err)) {
                tracing::debug!(error = %err, "ignored failure, retrying without using budget");
                tokio::time::sleep(self.options.delay_for(failed)).await;
                continue;
            }

            failed += 1;
            if failed >= attempts || !(self.retry_if)(&err) {
                return Err(err);
            }

            let delay = self.options.delay_for(failed - 1);
            tracing::warn!(
                attempt = failed,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Retry every failure with the given options.
pub async fn with_retry<T, E, F, Fut>(options: &RetryOptions, op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    Retry::new(options.clone()).run(op).await
}
