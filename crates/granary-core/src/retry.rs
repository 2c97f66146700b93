//! The one retry policy used across component boundaries.
//!
//! Transient failures at the statistics read and the synchronizer's
//! commit/push steps all go through [`RetryPolicy::run`] instead of inline
//! sleep loops, so attempt counts and backoff live in one place.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Policy for statistics reads under index contention.
    #[must_use]
    pub const fn statistics() -> Self {
        Self::new(3, Duration::from_millis(100))
    }

    /// Policy for mirror commit/push steps, using the configured error
    /// retry delay as the backoff base.
    #[must_use]
    pub const fn mirror(retry_delay: Duration) -> Self {
        Self::new(3, retry_delay)
    }

    /// Linear backoff: `base_delay * attempt`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `op`, retrying while `is_transient` approves the error. The
    /// final error is returned unchanged once attempts are exhausted. A
    /// small random jitter spreads concurrent retries apart.
    pub fn run<T, E>(
        &self,
        label: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts || !is_transient(&err) {
                        return Err(err);
                    }
                    let delay = self.backoff(attempt) + jitter(self.base_delay);
                    debug!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; backing off"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let cap = (base.as_millis() as u64 / 10).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Cell::new(0u32);
        let result: Result<u32, String> = policy.run(
            "test",
            |_| true,
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy".to_string())
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result, Ok(42));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhausts_bounded_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Cell::new(0u32);
        let result: Result<u32, String> = policy.run(
            "test",
            |_| true,
            || {
                calls.set(calls.get() + 1);
                Err("busy".to_string())
            },
        );
        assert_eq!(result, Err("busy".to_string()));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Cell::new(0u32);
        let result: Result<u32, String> = policy.run(
            "test",
            |err: &String| err == "busy",
            || {
                calls.set(calls.get() + 1);
                Err("broken".to_string())
            },
        );
        assert_eq!(result, Err("broken".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
    }
}
