//! Pipeline orchestration.
//!
//! The orchestrator drives the fixed stage sequence for one job: update
//! progress, notify listeners, invoke the stage handler through the
//! fault-tolerance registry, stop on the first failure. It is constructed
//! explicitly from its collaborators; there is no global state.


use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::cancellation::CancellationToken;
use crate::core::{Job, PipelineOutcome, PipelineStage, StageFn};
use crate::errors::DubflowError;
use crate::resilience::{
    CircuitBreakerConfig, RetryConfig, ServicePolicy, ServiceRegistry,
};
use crate::store::JobStore;
use crate::worker::{JobFn, WorkerPool};

/// Observer of per-job progress: `(job_id, progress, message)`.
///
/// Invoked at least once per stage transition, in stage order per job.
pub type ProgressListener = Arc<dyn Fn(&str, f64, &str) + Send + Sync>;

/// One-shot callback receiving the final outcome of an async run.
pub type CompletionCallback = Box<dyn FnOnce(PipelineOutcome) + Send>;

/// Registers the default per-stage resilience policies.
///
/// Flaky local work retries; the remote transcription and translation
/// providers sit behind circuit breakers. The output stage is left
/// unregistered and passes through.
pub fn register_default_policies(registry: &ServiceRegistry) {
    registry.register(
        "file_validation",
        ServicePolicy::Retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay_ms(1000),
        ),
    );
    registry.register(
        "audio_extraction",
        ServicePolicy::Retry(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(2000),
        ),
    );
    registry.register(
        "speech_to_text",
        ServicePolicy::CircuitBreaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(5)
                .with_open_timeout_ms(300_000),
        ),
    );
    registry.register(
        "translation",
        ServicePolicy::CircuitBreaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_open_timeout_ms(180_000),
        ),
    );
    registry.register(
        "text_to_speech",
        ServicePolicy::Retry(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(5000),
        ),
    );
    registry.register(
        "audio_processing",
        ServicePolicy::Retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay_ms(1000),
        ),
    );
    registry.register(
        "video_assembly",
        ServicePolicy::Retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay_ms(3000),
        ),
    );
}

/// Derives the dubbed-output location from the input path and language.
#[must_use]
pub fn output_path_for(input_path: &str, language: &str) -> String {
    let path = Path::new(input_path);
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("output");
    let file = match path.extension().and_then(std::ffi::OsStr::to_str) {
        Some(ext) => format!("{stem}_{language}_dubbed.{ext}"),
        None => format!("{stem}_{language}_dubbed"),
    };
    dir.join("output").join(file).to_string_lossy().into_owned()
}

/// Drives dubbing jobs through the fixed stage sequence.
pub struct PipelineOrchestrator {
    store: Arc<JobStore>,
    pool: Arc<WorkerPool>,
    registry: Arc<ServiceRegistry>,
    handlers: HashMap<PipelineStage, StageFn>,
    listeners: RwLock<Vec<ProgressListener>>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator over its collaborators.
    ///
    /// Stage handlers are attached with [`Self::with_stage_handler`];
    /// a stage without a handler fails the job when reached.
    #[must_use]
    pub fn new(
        store: Arc<JobStore>,
        pool: Arc<WorkerPool>,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            store,
            pool,
            registry,
            handlers: HashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Attaches the handler for one work stage.
    #[must_use]
    pub fn with_stage_handler(mut self, stage: PipelineStage, func: StageFn) -> Self {
        self.handlers.insert(stage, func);
        self
    }

    /// Registers a progress listener.
    pub fn add_progress_listener(&self, listener: ProgressListener) {
        self.listeners.write().push(listener);
    }

    /// Returns the fault-tolerance registry the stage calls go through.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Runs every work stage for `job`, in order.
    ///
    /// Each stage call is wrapped exactly once, here, through the
    /// registry. The first failure marks the job failed and stops the
    /// sequence; cancellation is honored at each stage boundary.
    pub async fn process(
        &self,
        job: &Job,
        cancel: &Arc<CancellationToken>,
    ) -> PipelineOutcome {
        let started = Instant::now();
        let total = PipelineStage::WORK_STAGES.len();
        let mut stages_completed = Vec::with_capacity(total + 1);
        let mut final_output = None;

        for (index, stage) in PipelineStage::WORK_STAGES.iter().enumerate() {
            if cancel.is_cancelled() {
                let reason = cancel
                    .reason()
                    .unwrap_or_else(|| "cancellation requested".to_string());
                tracing::info!(job_id = %job.id, stage = %stage, "job cancelled before stage");
                return self.fail_job(job, &reason, started, stages_completed);
            }

            let progress = (index as f64 / total as f64) * 100.0;
            if let Err(err) = self.store.update_progress(&job.id, *stage, progress) {
                return self.fail_job(job, &err.to_string(), started, stages_completed);
            }
            self.notify_progress(&job.id, progress, &format!("stage {stage} started"));

            let Some(func) = self.handlers.get(stage) else {
                let message = format!("no handler registered for stage {stage}");
                return self.fail_job(job, &message, started, stages_completed);
            };

            // The store record moved since the last stage; hand the
            // handler the current view of the job.
            let current = self.store.get(&job.id).unwrap_or_else(|| job.clone());

            match self
                .registry
                .execute(stage.service_name(), func, &current)
                .await
            {
                Ok(output) => {
                    tracing::debug!(job_id = %job.id, stage = %stage, "stage completed");
                    stages_completed.push(*stage);
                    final_output = Some(output);
                }
                Err(err) => {
                    let message = err.to_string();
                    tracing::warn!(job_id = %job.id, stage = %stage, error = %message, "stage failed");
                    return self.fail_job(job, &message, started, stages_completed);
                }
            }
        }

        // Prefer an output path reported by the output stage itself.
        let output_path = final_output
            .as_ref()
            .and_then(|o| o.get("output_path"))
            .and_then(serde_json::Value::as_str)
            .map_or_else(
                || output_path_for(&job.input_path, &job.target_language),
                ToString::to_string,
            );

        if let Err(err) = self.store.set_output(&job.id, &output_path) {
            return self.fail_job(job, &err.to_string(), started, stages_completed);
        }
        if let Err(err) = self
            .store
            .update_progress(&job.id, PipelineStage::Completed, 100.0)
        {
            return self.fail_job(job, &err.to_string(), started, stages_completed);
        }
        stages_completed.push(PipelineStage::Completed);
        self.notify_progress(&job.id, 100.0, "job completed");
        tracing::info!(job_id = %job.id, output = %output_path, "job completed");

        PipelineOutcome::succeeded(
            output_path,
            started.elapsed().as_secs_f64() * 1000.0,
            stages_completed,
        )
    }

    /// Submits `job` to the worker pool and returns the task id.
    ///
    /// `on_complete` is invoked exactly once with the final outcome,
    /// whether the run succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::PoolShutdown`] if the pool refuses the
    /// submission.
    pub fn process_async(
        self: &Arc<Self>,
        job: Job,
        on_complete: CompletionCallback,
    ) -> Result<String, DubflowError> {
        let orchestrator = Arc::clone(self);
        let callback = Arc::new(Mutex::new(Some(on_complete)));

        let func: JobFn = Arc::new(move |job, stop| {
            let orchestrator = Arc::clone(&orchestrator);
            let callback = Arc::clone(&callback);
            Box::pin(async move {
                let outcome = orchestrator.process(&job, &stop).await;
                if let Some(cb) = callback.lock().take() {
                    cb(outcome.clone());
                }
                // The run's own bookkeeping already recorded any failure.
                Ok(outcome)
            })
        });

        self.pool.submit(job, func)
    }

    /// Cancels a running job.
    ///
    /// Returns false if no worker unit owns the job. The in-flight stage
    /// call is not interrupted; the run stops at the next boundary.
    pub fn cancel(&self, job_id: &str) -> bool {
        if self.pool.cancel(job_id) {
            if let Err(err) = self.store.set_error(job_id, "job cancelled by request") {
                tracing::warn!(job_id, error = %err, "failed to record cancellation");
            }
            true
        } else {
            false
        }
    }

    /// Number of jobs currently being processed.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.pool.active_count()
    }

    fn fail_job(
        &self,
        job: &Job,
        message: &str,
        started: Instant,
        stages_completed: Vec<PipelineStage>,
    ) -> PipelineOutcome {
        if let Err(err) = self.store.set_error(&job.id, message) {
            tracing::warn!(job_id = %job.id, error = %err, "failed to record job failure");
        }
        let progress = self.store.get(&job.id).map_or(0.0, |j| j.progress);
        self.notify_progress(&job.id, progress, &format!("job failed: {message}"));

        PipelineOutcome::failed(
            message,
            started.elapsed().as_secs_f64() * 1000.0,
            stages_completed,
        )
    }

    fn notify_progress(&self, job_id: &str, progress: f64, message: &str) {
        let listeners: Vec<ProgressListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(job_id, progress, message);
        }
    }
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("handlers", &self.handlers.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
