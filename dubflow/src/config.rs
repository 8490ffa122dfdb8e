//! Scheduler configuration.
//!
//! One explicitly constructed config object is passed to the store, the
//! worker pool, and the orchestrator at startup; there is no global state.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by the job store, worker pool, and orchestrator.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Language codes accepted as dubbing targets.
    pub supported_languages: Vec<String>,
    /// Where the job snapshot file lives.
    pub snapshot_path: PathBuf,
    /// Interval between periodic snapshot writes.
    pub snapshot_interval: Duration,
    /// Maximum number of jobs processed concurrently.
    pub max_concurrent_jobs: usize,
    /// How long completed worker units stay inspectable before reaping.
    pub unit_grace_period: Duration,
    /// Poll interval of the dispatch loop.
    pub dispatch_tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            supported_languages: ["en", "zh", "es", "fr", "de"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            snapshot_path: PathBuf::from("./job_states.json"),
            snapshot_interval: Duration::from_secs(30),
            max_concurrent_jobs: 5,
            unit_grace_period: Duration::from_millis(500),
            dispatch_tick: Duration::from_millis(10),
        }
    }
}

impl SchedulerConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the supported target languages.
    #[must_use]
    pub fn with_supported_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_languages = languages.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the snapshot file path.
    #[must_use]
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = path.into();
        self
    }

    /// Sets the periodic snapshot interval.
    #[must_use]
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Sets the worker concurrency bound.
    #[must_use]
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Sets the grace period before completed units are reaped.
    #[must_use]
    pub fn with_unit_grace_period(mut self, grace: Duration) -> Self {
        self.unit_grace_period = grace;
        self
    }

    /// Returns true if `language` is an accepted dubbing target.
    #[must_use]
    pub fn supports_language(&self, language: &str) -> bool {
        self.supported_languages.iter().any(|l| l == language)
    }
}
