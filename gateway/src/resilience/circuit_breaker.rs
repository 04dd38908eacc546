//! Circuit breaker
//!
//! Fails fast while a downstream is unhealthy, then probes it with a bounded
//! number of trial calls before letting traffic through again.

use crate::error::CircuitError;
use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through
    Closed,
    /// Calls fail fast
    Open,
    /// Trial calls probe the downstream
    HalfOpen,
}

impl CircuitState {
    /// Convert to Prometheus metric value (0=Closed, 1=Open, 2=HalfOpen)
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }

    /// Lowercase label
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the circuit
    pub max_failures: u32,
    /// Time since the last failure before a trial call is allowed
    pub reset_timeout: Duration,
    /// Trial calls allowed in `HalfOpen`; half of them (rounded up) must
    /// succeed to close the circuit
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Transition observer: `(breaker name, from, to)`
pub type StateListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures counted in `Closed`
    pub failures: u32,
    /// Successful trial calls in the current `HalfOpen` episode
    pub successes: u32,
    /// Times the circuit has opened
    pub open_count: u64,
    /// Calls rejected without running
    pub rejected_count: u64,
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
    probe_in_flight: bool,
}

type Transition = (CircuitState, CircuitState);

/// Closed/open/half-open guard around arbitrary async calls
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    listeners: Vec<StateListener>,
    open_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.current_state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        if let Some(metrics) = Metrics::get() {
            metrics.set_circuit_state(&name, CircuitState::Closed);
        }
        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                half_open_calls: 0,
                probe_in_flight: false,
            }),
            listeners: Vec::new(),
            open_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// Register a callback fired on every state transition
    pub fn on_state_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, without applying time-based transitions
    pub fn current_state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Snapshot of counters
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            open_count: self.open_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
        }
    }

    /// Run `f` through the breaker
    ///
    /// Returns [`CircuitError::Open`] without calling `f` when the circuit
    /// rejects the call. Any `Err` from `f` counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = match self.admit() {
            Ok(probe) => probe,
            Err(retry_after) => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        };

        let mut permit = Permit {
            breaker: self,
            probe,
            settled: false,
        };
        let result = f().await;
        permit.settled = true;

        match result {
            Ok(value) => {
                self.record_success(probe);
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Decide whether a call may run
    ///
    /// `Ok(true)` marks a half-open probe. `Err` carries the retry hint.
    fn admit(&self) -> Result<bool, Duration> {
        let mut transition = None;
        let decision = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let elapsed = state
                        .last_failure
                        .map(|at| at.elapsed())
                        .unwrap_or(self.config.reset_timeout);
                    if elapsed >= self.config.reset_timeout {
                        state.state = CircuitState::HalfOpen;
                        state.successes = 0;
                        state.half_open_calls = 1;
                        state.probe_in_flight = true;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Ok(true)
                    } else {
                        Err(self.config.reset_timeout - elapsed)
                    }
                }
                CircuitState::HalfOpen => {
                    if !state.probe_in_flight
                        && state.half_open_calls < self.config.half_open_max_calls.max(1)
                    {
                        state.half_open_calls += 1;
                        state.probe_in_flight = true;
                        Ok(true)
                    } else {
                        Err(Duration::ZERO)
                    }
                }
            }
        };
        self.notify(transition);
        decision
    }

    fn record_success(&self, probe: bool) {
        let mut transition = None;
        {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => state.failures = 0,
                CircuitState::HalfOpen if probe => {
                    state.probe_in_flight = false;
                    state.successes += 1;
                    let needed = self.config.half_open_max_calls.max(1).div_ceil(2);
                    if state.successes >= needed {
                        state.state = CircuitState::Closed;
                        state.failures = 0;
                        state.successes = 0;
                        state.half_open_calls = 0;
                        transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                    }
                }
                // A call admitted before the circuit opened finished late
                CircuitState::HalfOpen | CircuitState::Open => {}
            }
        }
        self.notify(transition);
    }

    fn record_failure(&self) {
        let mut transition = None;
        {
            let mut state = self.state.lock();
            state.last_failure = Some(Instant::now());
            match state.state {
                CircuitState::Closed => {
                    state.failures += 1;
                    if state.failures >= self.config.max_failures {
                        state.state = CircuitState::Open;
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    state.state = CircuitState::Open;
                    state.probe_in_flight = false;
                    state.successes = 0;
                    state.half_open_calls = 0;
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                CircuitState::Open => {}
            }
        }
        self.notify(transition);
    }

    /// Release a half-open slot whose call was cancelled before finishing
    fn abandon_probe(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.probe_in_flight = false;
            state.half_open_calls = state.half_open_calls.saturating_sub(1);
        }
    }

    /// Fire listeners outside the state lock
    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        if to == CircuitState::Open {
            self.open_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(breaker = %self.name, from = from.as_str(), "circuit breaker opened");
        } else {
            tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker state change"
            );
        }
        if let Some(metrics) = Metrics::get() {
            metrics.set_circuit_state(&self.name, to);
        }
        for listener in &self.listeners {
            listener(&self.name, from, to);
        }
    }
}

struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.abandon_probe();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;

    fn breaker(max_failures: u32, half_open_max_calls: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                max_failures,
                reset_timeout: Duration::from_secs(30),
                half_open_max_calls,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = breaker(3, 1);
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test]
    async fn opens_after_max_failures_and_skips_the_call() {
        let cb = breaker(3, 1);
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(CircuitError::Inner("boom"))));
        }
        assert_eq!(cb.current_state(), CircuitState::Open);

        let ran = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().rejected_count, 1);
        assert_eq!(cb.stats().open_count, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = breaker(3, 1);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_reports_remaining_wait() {
        let cb = breaker(1, 1);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        match succeed(&cb).await {
            Err(CircuitError::Open { retry_after, name }) => {
                assert_eq!(name, "test");
                assert_eq!(retry_after, Duration::from_secs(20));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_one_trial_after_reset_timeout() {
        let cb = Arc::new(breaker(2, 3));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.call(|| async move {
                    release_rx.await.ok();
                    Ok::<(), &'static str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        // The probe is still running: a second caller is turned away
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Open { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        // Two of three trial calls must succeed
        succeed(&cb).await.unwrap();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let cb = breaker(1, 3);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(31)).await;

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert_eq!(cb.stats().open_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_probe_frees_the_slot() {
        let cb = breaker(1, 1);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(31)).await;

        let pending = cb.call(|| std::future::pending::<Result<(), &'static str>>());
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_see_every_transition() {
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let cb = {
            let seen = Arc::clone(&seen);
            breaker(1, 1).on_state_change(move |name, from, to| {
                seen.lock().push((name.to_string(), from, to));
            })
        };

        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&cb).await.unwrap();

        let seen = seen.lock();
        assert_eq!(
            seen.iter().map(|(_, f, t)| (*f, *t)).collect::<Vec<_>>(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
        assert!(seen.iter().all(|(name, _, _)| name == "test"));
    }
}
