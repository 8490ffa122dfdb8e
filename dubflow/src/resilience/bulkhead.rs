//! Bulkhead isolation: a hard admission-control gate on concurrent calls.
//!
//! A submission that would exceed the bound is refused immediately rather
//! than queued. The active-call counter is decremented exactly once per
//! accepted call, including when the call errors or panics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::errors::DubflowError;

/// Configuration for a bulkhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum calls allowed in flight at once.
    pub max_concurrent_calls: usize,
    /// Capacity of the executor's internal queue.
    pub queue_capacity: usize,
    /// How long `execute` waits for a result, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            queue_capacity: 100,
            call_timeout_ms: 30_000,
        }
    }
}

impl BulkheadConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    /// Sets the execute wait timeout.
    #[must_use]
    pub fn with_call_timeout_ms(mut self, timeout: u64) -> Self {
        self.call_timeout_ms = timeout;
        self
    }
}

/// Read-only observability snapshot of a bulkhead.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadMetrics {
    /// Calls currently in flight.
    pub active_calls: usize,
    /// Calls refused at admission since construction.
    pub rejected_calls: u64,
    /// The configured concurrency bound.
    pub max_concurrent_calls: usize,
    /// active / max, 0 when the bound is 0.
    pub utilization: f64,
}

/// Decrements the active counter exactly once, even if the guarded call
/// panics.
struct ActiveCallGuard(Arc<AtomicUsize>);

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bulkhead guarding one logical service.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    active_calls: Arc<AtomicUsize>,
    rejected_calls: AtomicU64,
}

impl Bulkhead {
    /// Creates a bulkhead for the named service.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            config,
            active_calls: Arc::new(AtomicUsize::new(0)),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Submits an operation, returning a handle to its running task.
    ///
    /// Admission is checked atomically against the concurrency bound; a
    /// refused submission never starts the operation.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::BulkheadRejected`] when the bound is full.
    pub fn try_submit<T, Fut>(
        &self,
        operation: Fut,
    ) -> Result<JoinHandle<Result<T, DubflowError>>, DubflowError>
    where
        Fut: std::future::Future<Output = Result<T, DubflowError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut current = self.active_calls.load(Ordering::SeqCst);
        loop {
            if current >= self.config.max_concurrent_calls {
                self.rejected_calls.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    service = %self.name,
                    active = current,
                    "bulkhead refused call at capacity"
                );
                return Err(DubflowError::BulkheadRejected {
                    service: self.name.clone(),
                    active: current,
                    max: self.config.max_concurrent_calls,
                });
            }
            match self.active_calls.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let guard = ActiveCallGuard(Arc::clone(&self.active_calls));
        Ok(tokio::spawn(async move {
            let _guard = guard;
            operation.await
        }))
    }

    /// Runs an operation and waits for its result up to the configured
    /// timeout.
    ///
    /// A timeout abandons the wait only; the underlying call keeps running
    /// and its slot is released when it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::BulkheadRejected`] at capacity,
    /// [`DubflowError::BulkheadTimeout`] if no result arrives in time, or
    /// the operation's own error.
    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, DubflowError>
    where
        Fut: std::future::Future<Output = Result<T, DubflowError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.try_submit(operation)?;
        let timeout = Duration::from_millis(self.config.call_timeout_ms);

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DubflowError::stage(format!(
                "bulkhead call aborted: {join_err}"
            ))),
            Err(_) => {
                tracing::warn!(
                    service = %self.name,
                    timeout_ms = self.config.call_timeout_ms,
                    "bulkhead call result wait timed out"
                );
                Err(DubflowError::BulkheadTimeout {
                    service: self.name.clone(),
                    timeout_ms: self.config.call_timeout_ms,
                })
            }
        }
    }

    /// Calls currently in flight.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    /// Returns an observability snapshot.
    #[must_use]
    pub fn metrics(&self) -> BulkheadMetrics {
        let active = self.active_calls();
        let max = self.config.max_concurrent_calls;
        BulkheadMetrics {
            active_calls: active,
            rejected_calls: self.rejected_calls.load(Ordering::SeqCst),
            max_concurrent_calls: max,
            utilization: if max > 0 {
                active as f64 / max as f64
            } else {
                0.0
            },
        }
    }
}
