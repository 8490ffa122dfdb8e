//! Circuit breaker with a sliding-window call history.
//!
//! State machine: CLOSED -> OPEN when failures reach the threshold,
//! OPEN -> HALF_OPEN once the open timeout elapses, HALF_OPEN -> CLOSED
//! after enough probe successes, HALF_OPEN -> OPEN on any failure.
//! Thresholds are evaluated against a time-bounded history, not all-time
//! totals.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::errors::DubflowError;

/// The state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through normally.
    Closed,
    /// Calls are refused until the open timeout elapses.
    Open,
    /// A limited probe period after the timeout.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker while closed.
    pub failure_threshold: u32,
    /// Probe successes required to close again from half-open.
    pub success_threshold: u32,
    /// How long the breaker stays open before probing, in milliseconds.
    pub open_timeout_ms: u64,
    /// Sliding-window duration for call history, in milliseconds.
    pub monitor_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 60_000,
            monitor_window_ms: 300_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the success threshold.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Sets the open timeout.
    #[must_use]
    pub fn with_open_timeout_ms(mut self, timeout: u64) -> Self {
        self.open_timeout_ms = timeout;
        self
    }

    /// Sets the sliding-window duration.
    #[must_use]
    pub fn with_monitor_window_ms(mut self, window: u64) -> Self {
        self.monitor_window_ms = window;
        self
    }
}

/// Read-only observability snapshot of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive-failure counter.
    pub failure_count: u32,
    /// Half-open probe success counter.
    pub success_count: u32,
    /// Calls recorded inside the sliding window.
    pub window_calls: usize,
    /// Successes inside the window.
    pub window_successes: usize,
    /// Failures inside the window.
    pub window_failures: usize,
    /// Success rate over the window, 0 when empty.
    pub success_rate: f64,
    /// Milliseconds since the last recorded failure, if any.
    pub time_since_last_failure_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    success: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    window: VecDeque<CallRecord>,
}

/// A circuit breaker guarding one logical service.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the named service.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                window: VecDeque::new(),
            }),
        }
    }

    /// Runs `operation` through the breaker.
    ///
    /// The internal lock is taken for the admission decision and again to
    /// record the outcome; it is never held across the wrapped call.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::CircuitOpen`] without invoking the
    /// operation when the breaker is open, or the operation's own error.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, DubflowError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, DubflowError>>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns an observability snapshot. Purges expired window entries
    /// but has no other side effects.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        Self::purge_window(&mut inner, now, self.config.monitor_window_ms);

        let window_calls = inner.window.len();
        let window_successes = inner.window.iter().filter(|r| r.success).count();
        let window_failures = window_calls - window_successes;
        let success_rate = if window_calls > 0 {
            window_successes as f64 / window_calls as f64
        } else {
            0.0
        };

        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            window_calls,
            window_successes,
            window_failures,
            success_rate,
            time_since_last_failure_ms: inner
                .last_failure_at
                .map(|at| now.duration_since(at).as_millis() as u64),
        }
    }

    fn admit(&self) -> Result<(), DubflowError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        Self::purge_window(&mut inner, now, self.config.monitor_window_ms);

        if inner.state == CircuitState::Open {
            let waited = inner
                .last_failure_at
                .map_or(Duration::MAX, |at| now.duration_since(at));

            if waited >= Duration::from_millis(self.config.open_timeout_ms) {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                tracing::info!(service = %self.name, "circuit breaker probing (half-open)");
            } else {
                tracing::warn!(service = %self.name, "circuit breaker open, call refused");
                return Err(DubflowError::CircuitOpen {
                    service: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.window.push_back(CallRecord {
            at: now,
            success: true,
        });

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    tracing::info!(service = %self.name, "circuit breaker closed, service recovered");
                }
            }
            CircuitState::Closed => {
                // A healthy call works off one recorded failure.
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.window.push_back(CallRecord {
            at: now,
            success: false,
        });
        inner.failure_count += 1;
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        service = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!(service = %self.name, "probe failed, circuit breaker re-opened");
            }
            CircuitState::Open => {}
        }
    }

    fn purge_window(inner: &mut BreakerInner, now: Instant, window_ms: u64) {
        let window = Duration::from_millis(window_ms);
        while inner
            .window
            .front()
            .is_some_and(|r| now.duration_since(r.at) > window)
        {
            inner.window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_open_timeout_ms(50)
            .with_monitor_window_ms(10_000)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<i32, DubflowError> {
        breaker
            .call(|| async { Err(DubflowError::stage("boom")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<i32, DubflowError> {
        breaker.call(|| async { Ok(1) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_refuses_without_invoking() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked_clone = invoked.clone();
        let result: Result<i32, DubflowError> = breaker
            .call(|| {
                let invoked = invoked_clone.clone();
                async move {
                    invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await;

        assert!(matches!(result, Err(DubflowError::CircuitOpen { .. })));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_half_open_then_closes_after_probe_successes() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(70)).await;

        // First probe call transitions to half-open and runs.
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_any_failure() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(70)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_closed_success_decays_failure_count() {
        let breaker = CircuitBreaker::new("svc", fast_config());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.metrics().failure_count, 2);

        let _ = succeed(&breaker).await;
        assert_eq!(breaker.metrics().failure_count, 1);

        // The decayed count keeps the breaker closed through another failure.
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_error_passes_through_unchanged() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        let err = fail(&breaker).await.unwrap_err();
        assert_eq!(err.to_string(), "stage execution error: boom");
    }

    #[tokio::test]
    async fn test_window_purges_old_entries() {
        let breaker = CircuitBreaker::new(
            "svc",
            fast_config().with_monitor_window_ms(30),
        );

        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.metrics().window_calls, 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.metrics().window_calls, 0);
    }

    #[tokio::test]
    async fn test_metrics_shape() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        let _ = succeed(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;

        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.window_calls, 3);
        assert_eq!(metrics.window_successes, 2);
        assert_eq!(metrics.window_failures, 1);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 0.001);
        assert!(metrics.time_since_last_failure_ms.is_some());
    }
}
