//! Retry policy with exponential backoff and jitter

use hearth_core::{Categorized, ErrorCategory};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lock-free xorshift64 PRNG for jitter randomness
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b);
        let seed = if seed == 0 { 0x853c49e6748fea9b } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next(&self) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let mut x = old;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if self
                .state
                .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return x;
            }
        }
    }

    /// Random f64 in `[0.0, 1.0)`
    fn next_f64(&self) -> f64 {
        (self.next() >> 11) as f64 / (1u64 << 53) as f64
    }
}

static JITTER_RNG: std::sync::LazyLock<Xorshift64> = std::sync::LazyLock::new(Xorshift64::new);

/// When and how long to wait between attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Up to this fraction of the delay is added at random (0 disables jitter)
    pub jitter_factor: f64,
    /// Categories worth retrying
    pub retryable: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.25,
            retryable: vec![
                ErrorCategory::Network,
                ErrorCategory::Timeout,
                ErrorCategory::Unavailable,
                ErrorCategory::RateLimit,
            ],
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) failing with `err` should
    /// be followed by another attempt
    pub fn should_retry<E: Categorized>(&self, err: &E, attempt: u32) -> bool {
        attempt < self.max_attempts && self.retryable.contains(&err.category())
    }

    /// Delay after `attempt` (1-based) failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with_jitter(attempt, JITTER_RNG.next_f64())
    }

    /// Delay with an explicit jitter sample in `[0, 1)`
    pub fn delay_for_attempt_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // Microseconds keep small delays exact
        let max_us = self.max_delay.as_micros() as f64;
        let base_us = (self.initial_delay.as_micros() as f64
            * self.multiplier.powi((attempt - 1) as i32))
        .min(max_us);
        let jitter_us = base_us * self.jitter_factor.clamp(0.0, 1.0) * jitter.clamp(0.0, 1.0);

        Duration::from_micros((base_us + jitter_us).min(max_us) as u64)
    }

    /// Run `f` until it succeeds, fails permanently, or attempts run out
    pub async fn execute<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Categorized + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        category = %e.category(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        tracing::warn!(operation, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug)]
    struct TestError(ErrorCategory);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error ({})", self.0)
        }
    }

    impl Categorized for TestError {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn exponential_growth_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(500),
            ..no_jitter()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_adds_at_most_the_factor() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for_attempt_with_jitter(1, 0.0),
            Duration::from_millis(100)
        );
        assert_eq!(
            policy.delay_for_attempt_with_jitter(1, 1.0),
            Duration::from_millis(125)
        );
        for _ in 0..100 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125));
        }
    }

    #[test]
    fn only_transient_categories_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&TestError(ErrorCategory::Timeout), 1));
        assert!(policy.should_retry(&TestError(ErrorCategory::Unavailable), 2));
        assert!(!policy.should_retry(&TestError(ErrorCategory::Unavailable), 3));
        assert!(!policy.should_retry(&TestError(ErrorCategory::Validation), 1));
        assert!(!RetryPolicy::none().should_retry(&TestError(ErrorCategory::Network), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = no_jitter()
            .execute("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError(ErrorCategory::Network))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = no_jitter()
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorCategory::Timeout))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execute_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorCategory::Shutdown))
            })
            .await;
        assert_eq!(result.unwrap_err().0, ErrorCategory::Shutdown);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
