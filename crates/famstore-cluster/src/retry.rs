//! Bounded retry with fixed backoff

use std::thread;
use std::time::Duration;

use tracing::warn;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1
    pub max_attempts: u32,
    /// Pause before each retry
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self { max_attempts: 1, backoff: Duration::ZERO }
    }

    /// The first attempt plus `retries` more.
    pub fn with_retries(retries: u32) -> Self {
        Self { max_attempts: retries.saturating_add(1), backoff: Duration::ZERO }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    ///
    /// The last error is returned.
    pub fn run<T, E, F, R>(&self, mut op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if attempt < max && is_retryable(&e) => {
                    warn!(attempt, max_attempts = max, error = %e, "retrying");
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::once() }
}
