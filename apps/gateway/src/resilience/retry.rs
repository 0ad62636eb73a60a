//! Retry with exponential backoff.
//!
//! Only failures the caller classifies as transient are retried. Anything else
//! is returned on the first attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts, backing off 1s then 2s, never more than 10s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Per-call bookkeeping; lives only for the duration of one `run`.
#[derive(Debug)]
struct RetryState {
    attempt: u32,
    next_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails terminally, or the attempt
    /// budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, P>(&self, label: &str, mut operation: F, is_transient: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut state = RetryState {
            attempt: 0,
            next_delay: self.delay_for(1),
        };

        loop {
            state.attempt += 1;
            match operation().await {
                Ok(value) => {
                    if state.attempt > 1 {
                        debug!(label, attempts = state.attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_transient(&e) && state.attempt < max_attempts => {
                    warn!(
                        label,
                        attempt = state.attempt,
                        delay_ms = state.next_delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(state.next_delay).await;
                    state.next_delay = self.delay_for(state.attempt + 1);
                }
                Err(e) => {
                    if is_transient(&e) {
                        warn!(label, attempts = state.attempt, error = %e, "Retry budget exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Terminal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn transient(e: &TestError) -> bool {
        *e == TestError::Transient
    }

    #[test]
    fn test_default_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_two_transients() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = RetryPolicy::default()
            .run(
                "test",
                || {
                    let counter = counter.clone();
                    async move {
                        match counter.fetch_add(1, Ordering::SeqCst) {
                            0 | 1 => Err(TestError::Transient),
                            _ => Ok("done"),
                        }
                    }
                },
                transient,
            )
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = RetryPolicy::default()
            .run(
                "test",
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::Terminal) }
                },
                transient,
            )
            .await;

        assert_eq!(result, Err(TestError::Terminal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = RetryPolicy::default()
            .run(
                "test",
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::Transient) }
                },
                transient,
            )
            .await;

        assert_eq!(result, Err(TestError::Transient));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Slept 1s + 2s between the three attempts.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3100));
    }
}
