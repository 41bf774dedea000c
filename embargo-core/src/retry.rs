//! Bounded retry with randomized backoff for repository and catalog calls.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{CatalogError, EmbargoError, RepositoryError};

/// Outcome of a call that could not be completed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{label}: gave up after {attempts} attempts: {last}")]
    Exhausted { label: String, attempts: u32, last: E },

    #[error(transparent)]
    Permanent(E),
}

/// How often and how patiently to retry a fallible call.
pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("min_delay", &self.min_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl<E: std::error::Error + 'static> RetryPolicy<E> {
    pub fn new(max_attempts: u32, retryable: fn(&E) -> bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retryable,
        }
    }

    pub fn with_backoff(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay.min(max_delay);
        self.max_delay = max_delay;
        self
    }

    /// Uniformly random delay in `[min_delay, max_delay]`.
    pub fn next_delay(&self) -> Duration {
        if self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        let lo = self.min_delay.as_millis() as u64;
        let hi = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if (self.retryable)(&e) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            label: label.to_string(),
                            attempts: attempt,
                            last: e,
                        });
                    }
                    let delay = self.next_delay();
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(RetryError::Permanent(e)),
            }
        }
    }
}

impl RetryPolicy<RepositoryError> {
    /// Ten attempts, 2–10 s apart, on connectivity and operational failures.
    pub fn repository() -> Self {
        Self::new(10, RepositoryError::is_transient)
            .with_backoff(Duration::from_secs(2), Duration::from_secs(10))
    }
}

impl RetryPolicy<CatalogError> {
    /// Two attempts, 0.5–2 s apart, on catalog database errors.
    pub fn catalog() -> Self {
        Self::new(2, CatalogError::is_transient)
            .with_backoff(Duration::from_millis(500), Duration::from_secs(2))
    }
}

impl From<RetryError<RepositoryError>> for EmbargoError {
    fn from(err: RetryError<RepositoryError>) -> Self {
        match err {
            RetryError::Exhausted {
                label,
                attempts,
                last,
            } => EmbargoError::RetriesExhausted {
                label,
                attempts,
                message: last.to_string(),
            },
            RetryError::Permanent(e) => EmbargoError::Repository(e),
        }
    }
}

impl From<RetryError<CatalogError>> for EmbargoError {
    fn from(err: RetryError<CatalogError>) -> Self {
        match err {
            RetryError::Exhausted {
                label,
                attempts,
                last,
            } => EmbargoError::RetriesExhausted {
                label,
                attempts,
                message: last.to_string(),
            },
            RetryError::Permanent(e) => EmbargoError::Catalog(e),
        }
    }
}
