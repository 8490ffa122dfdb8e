//! In-memory job store with periodic snapshot persistence.
//!
//! The store owns the authoritative job map. Every mutation goes through a
//! synchronized operation here; callers only ever hold clones of records.
//! A supervised background task snapshots the map to disk at a fixed
//! interval and on shutdown.

mod snapshot;

pub use snapshot::{load_snapshot, write_snapshot};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::core::{Job, JobStatus, PipelineStage};
use crate::errors::DubflowError;

struct Autosave {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Thread-safe store of job records.
pub struct JobStore {
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, Job>>,
    autosave: Mutex<Option<Autosave>>,
}

impl JobStore {
    /// Creates a store, loading the snapshot file if one is present.
    ///
    /// Loaded records are observability state from a previous run; they are
    /// not re-dispatched.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let mut jobs = HashMap::new();
        match snapshot::load_snapshot(&config.snapshot_path) {
            Ok(restored) => {
                if !restored.is_empty() {
                    tracing::info!(count = restored.len(), "restored jobs from snapshot");
                }
                for job in restored {
                    jobs.insert(job.id.clone(), job);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to load job snapshot");
            }
        }

        Self {
            config,
            jobs: RwLock::new(jobs),
            autosave: Mutex::new(None),
        }
    }

    /// Creates a new pending job.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::UnsupportedLanguage`] if `target_language`
    /// is not in the configured supported set.
    pub fn create(
        &self,
        input_path: &str,
        target_language: &str,
    ) -> Result<Job, DubflowError> {
        if !self.config.supports_language(target_language) {
            return Err(DubflowError::UnsupportedLanguage {
                language: target_language.to_string(),
            });
        }

        let job = Job::new(input_path, target_language);
        self.jobs.write().insert(job.id.clone(), job.clone());
        tracing::debug!(job_id = %job.id, language = target_language, "job created");
        Ok(job)
    }

    /// Updates a job's stage and progress.
    ///
    /// Progress is clamped to [0, 100]. A terminal stage also sets the
    /// matching terminal status and the completion timestamp; any other
    /// stage marks the job as processing. No callbacks fire here.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::JobNotFound`] for an unknown id.
    pub fn update_progress(
        &self,
        id: &str,
        stage: PipelineStage,
        progress: f64,
    ) -> Result<(), DubflowError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id).ok_or_else(|| DubflowError::JobNotFound {
            id: id.to_string(),
        })?;

        job.current_stage = stage;
        job.progress = progress.clamp(0.0, 100.0);

        match stage {
            PipelineStage::Completed => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
            }
            PipelineStage::Failed => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
            }
            _ => {
                job.status = JobStatus::Processing;
            }
        }
        Ok(())
    }

    /// Returns a clone of the job, if known.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    /// Returns all jobs that are pending or processing.
    #[must_use]
    pub fn list_active(&self) -> Vec<Job> {
        self.jobs
            .read()
            .values()
            .filter(|job| job.status.is_active())
            .cloned()
            .collect()
    }

    /// Returns all known jobs.
    #[must_use]
    pub fn list_all(&self) -> Vec<Job> {
        self.jobs.read().values().cloned().collect()
    }

    /// Marks a job as failed with a human-readable message.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::JobNotFound`] for an unknown id.
    pub fn set_error(&self, id: &str, message: &str) -> Result<(), DubflowError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id).ok_or_else(|| DubflowError::JobNotFound {
            id: id.to_string(),
        })?;

        job.status = JobStatus::Failed;
        job.current_stage = PipelineStage::Failed;
        job.error_message = Some(message.to_string());
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Records the produced output file for a job.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::JobNotFound`] for an unknown id.
    pub fn set_output(&self, id: &str, output_path: &str) -> Result<(), DubflowError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id).ok_or_else(|| DubflowError::JobNotFound {
            id: id.to_string(),
        })?;
        job.output_path = Some(output_path.to_string());
        Ok(())
    }

    /// Records which worker unit owns a job.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::JobNotFound`] for an unknown id.
    pub fn set_worker(&self, id: &str, worker_id: &str) -> Result<(), DubflowError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id).ok_or_else(|| DubflowError::JobNotFound {
            id: id.to_string(),
        })?;
        job.worker_id = Some(worker_id.to_string());
        Ok(())
    }

    /// Writes a snapshot of the current job map to disk.
    ///
    /// The map lock is released before any file IO happens.
    ///
    /// # Errors
    ///
    /// Returns IO or serialization errors from the snapshot write.
    pub fn save(&self) -> Result<(), DubflowError> {
        let jobs: Vec<Job> = self.list_all();
        snapshot::write_snapshot(&self.config.snapshot_path, &jobs)
    }

    /// Starts the supervised periodic-save task.
    ///
    /// Idempotent: a second call while a task is running does nothing.
    pub fn spawn_autosave(self: &Arc<Self>) {
        let mut autosave = self.autosave.lock();
        if autosave.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = Arc::clone(self);
        let interval = store.config.snapshot_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        if let Err(err) = store.save() {
                            tracing::warn!(error = %err, "periodic job snapshot failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *autosave = Some(Autosave {
            shutdown_tx,
            handle,
        });
    }

    /// Stops the autosave task and writes a final snapshot.
    pub async fn shutdown(&self) {
        let autosave = self.autosave.lock().take();
        if let Some(Autosave {
            shutdown_tx,
            handle,
        }) = autosave
        {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("autosave task did not stop within timeout");
            }
        }

        if let Err(err) = self.save() {
            tracing::warn!(error = %err, "final job snapshot failed");
        }
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs", &self.jobs.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> SchedulerConfig {
        SchedulerConfig::new()
            .with_supported_languages(["en", "es"])
            .with_snapshot_path(dir.path().join("jobs.json"))
    }

    #[test]
    fn test_create_validates_language() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_config(&dir));

        let job = store.create("/media/talk.mp4", "es").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_stage, PipelineStage::Validation);

        let err = store.create("/media/talk.mp4", "xx").unwrap_err();
        assert!(matches!(err, DubflowError::UnsupportedLanguage { .. }));
    }

    #[test]
    fn test_update_progress_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_config(&dir));
        let job = store.create("/media/talk.mp4", "es").unwrap();

        store
            .update_progress(&job.id, PipelineStage::Translation, 40.0)
            .unwrap();
        let job = store.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.current_stage, PipelineStage::Translation);
        assert!((job.progress - 40.0).abs() < f64::EPSILON);
        assert!(job.completed_at.is_none());

        store
            .update_progress(&job.id, PipelineStage::Completed, 100.0)
            .unwrap();
        let job = store.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_update_progress_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_config(&dir));
        let job = store.create("/media/talk.mp4", "es").unwrap();

        store
            .update_progress(&job.id, PipelineStage::Extraction, 150.0)
            .unwrap();
        assert!((store.get(&job.id).unwrap().progress - 100.0).abs() < f64::EPSILON);

        store
            .update_progress(&job.id, PipelineStage::Extraction, -5.0)
            .unwrap();
        assert!((store.get(&job.id).unwrap().progress - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_config(&dir));

        let err = store
            .update_progress("job_missing", PipelineStage::Extraction, 10.0)
            .unwrap_err();
        assert!(matches!(err, DubflowError::JobNotFound { .. }));
        assert!(store.get("job_missing").is_none());
    }

    #[test]
    fn test_set_error_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_config(&dir));
        let job = store.create("/media/talk.mp4", "es").unwrap();

        store
            .update_progress(&job.id, PipelineStage::Translation, 40.0)
            .unwrap();
        store.set_error(&job.id, "upstream failure").unwrap();

        let job = store.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.current_stage, PipelineStage::Failed);
        assert_eq!(job.error_message.as_deref(), Some("upstream failure"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_list_active_excludes_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_config(&dir));

        let a = store.create("/media/a.mp4", "es").unwrap();
        let b = store.create("/media/b.mp4", "es").unwrap();
        store.set_error(&b.id, "boom").unwrap();

        let active = store.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        assert_eq!(store.list_all().len(), 2);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let store = JobStore::new(config.clone());
        let a = store.create("/media/a.mp4", "es").unwrap();
        store.set_worker(&a.id, "worker_1").unwrap();
        store
            .update_progress(&a.id, PipelineStage::Synthesis, 55.0)
            .unwrap();
        store.save().unwrap();

        let reloaded = JobStore::new(config);
        let restored = reloaded.get(&a.id).unwrap();
        assert_eq!(restored.current_stage, PipelineStage::Synthesis);
        assert_eq!(restored.status, JobStatus::Processing);
        assert!((restored.progress - 55.0).abs() < f64::EPSILON);
        // Worker ownership does not survive a restart.
        assert!(restored.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_autosave_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir).with_snapshot_interval(Duration::from_millis(20));
        let path = config.snapshot_path.clone();

        let store = Arc::new(JobStore::new(config));
        store.spawn_autosave();
        store.create("/media/a.mp4", "es").unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(path.exists());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_save() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir).with_snapshot_interval(Duration::from_secs(3600));
        let path = config.snapshot_path.clone();

        let store = Arc::new(JobStore::new(config));
        store.spawn_autosave();
        store.create("/media/a.mp4", "es").unwrap();
        store.shutdown().await;

        assert!(path.exists());
        let jobs = load_snapshot(&path).unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
