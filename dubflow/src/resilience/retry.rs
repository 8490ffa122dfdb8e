//! Retry execution with configurable backoff and jitter.
//!
//! Delays grow with the configured backoff shape, are capped at the
//! maximum delay, and optionally carry jitter to prevent thundering herd.
//! The final error is returned unchanged so callers see the original
//! failure kind.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff shape for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * exponential_base^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Fixed,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the initial one. Treated as at least 1.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Cap applied to the computed delay, before jitter.
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff.
    pub exponential_base: f64,
    /// Backoff shape.
    pub backoff: BackoffStrategy,
    /// Multiply the delay by a uniform factor in [0.5, 1.5].
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            backoff: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff shape.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay to wait after the given zero-based attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay_ms as f64;
        let raw = match self.backoff {
            BackoffStrategy::Exponential => {
                base * self.exponential_base.powi(attempt.min(i32::MAX as usize) as i32)
            }
            BackoffStrategy::Linear => base * (attempt + 1) as f64,
            BackoffStrategy::Fixed => base,
        };

        let capped = raw.min(self.max_delay_ms as f64).max(0.0);

        let jittered = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }
}

/// Executes an operation with retries per a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Creates an executor for the given config.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the config this executor runs with.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, retrying on failure with backoff.
    ///
    /// The inter-attempt sleep suspends only the calling task. After the
    /// configured attempts are exhausted, the last error is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns the final error produced by `operation`.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(attempts = attempt + 1, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts {
                        tracing::warn!(attempts, error = %err, "all retry attempts failed");
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
