//! Test support: scripted stage handlers and job fixtures.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{Job, StageFn, StageOutput};
use crate::errors::DubflowError;

/// A scripted stage handler that records calls and can be told to fail
/// its first N invocations.
pub struct StageProbe {
    calls: AtomicUsize,
    fail_times: usize,
    delay: Mutex<Option<Duration>>,
    output: Mutex<StageOutput>,
}

impl StageProbe {
    /// A probe that always succeeds with an empty output.
    #[must_use]
    pub fn succeeding() -> Arc<Self> {
        Self::failing_times(0)
    }

    /// A probe that fails its first `n` calls, then succeeds.
    ///
    /// Pass `usize::MAX` for a probe that always fails.
    #[must_use]
    pub fn failing_times(n: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_times: n,
            delay: Mutex::new(None),
            output: Mutex::new(StageOutput::new()),
        })
    }

    /// How many times the probe has been invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Adds an entry to the output map successful calls return.
    pub fn set_output_entry(&self, key: impl Into<String>, value: serde_json::Value) {
        self.output.lock().insert(key.into(), value);
    }

    /// Makes every invocation sleep before returning.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Builds the [`StageFn`] backed by this probe.
    #[must_use]
    pub fn stage_fn(self: &Arc<Self>) -> StageFn {
        let probe = Arc::clone(self);
        Arc::new(move |_job: Job| {
            let probe = Arc::clone(&probe);
            Box::pin(async move {
                let delay = *probe.delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                let n = probe.calls.fetch_add(1, Ordering::SeqCst);
                if n < probe.fail_times {
                    Err(DubflowError::stage(format!("scripted failure {n}")))
                } else {
                    Ok(probe.output.lock().clone())
                }
            })
        })
    }
}

impl std::fmt::Debug for StageProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageProbe")
            .field("calls", &self.call_count())
            .field("fail_times", &self.fail_times)
            .finish()
    }
}

/// A job record for tests that do not need a store.
#[must_use]
pub fn sample_job() -> Job {
    Job::new("/media/fixture.mp4", "es")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_counts_and_scripts_failures() {
        let probe = StageProbe::failing_times(2);
        let func = probe.stage_fn();

        assert!(func(sample_job()).await.is_err());
        assert!(func(sample_job()).await.is_err());
        assert!(func(sample_job()).await.is_ok());
        assert_eq!(probe.call_count(), 3);
    }

    #[tokio::test]
    async fn test_probe_output_entries() {
        let probe = StageProbe::succeeding();
        probe.set_output_entry("segments", serde_json::json!(12));

        let output = probe.stage_fn()(sample_job()).await.unwrap();
        assert_eq!(output.get("segments"), Some(&serde_json::json!(12)));
    }
}
