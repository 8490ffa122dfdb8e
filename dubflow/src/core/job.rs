//! Job records and processing outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::stage::PipelineStage;

/// The lifecycle status of a dubbing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for a worker.
    Pending,
    /// A worker is driving the pipeline.
    Processing,
    /// All stages finished.
    Completed,
    /// A stage failed or the job was cancelled.
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed`/`Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true for `Pending`/`Processing`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A single dubbing job record.
///
/// Mutated exclusively through the job store's synchronized operations;
/// everything handed out of the store is a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique id.
    pub id: String,
    /// Reference to the source media file.
    pub input_path: String,
    /// Target language code for the dub.
    pub target_language: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Progress percentage in [0, 100].
    pub progress: f64,
    /// The stage the job is currently in.
    pub current_stage: PipelineStage,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Completion timestamp, set when the job reaches a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reference to the produced output file.
    #[serde(default)]
    pub output_path: Option<String>,
    /// Sanitized, human-readable failure description.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Id of the worker unit that owns the job. Not persisted.
    #[serde(skip)]
    pub worker_id: Option<String>,
}

impl Job {
    /// Creates a new pending job at the first work stage.
    #[must_use]
    pub fn new(input_path: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            id: generate_job_id(),
            input_path: input_path.into(),
            target_language: target_language.into(),
            status: JobStatus::Pending,
            progress: 0.0,
            current_stage: PipelineStage::Validation,
            created_at: Utc::now(),
            completed_at: None,
            output_path: None,
            error_message: None,
            worker_id: None,
        }
    }

    /// Returns true once the job has reached a terminal status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Generates a collision-free job identifier.
#[must_use]
pub fn generate_job_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("job_{}", &hex[..12])
}

/// The result of driving one job through the full pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Whether every stage completed.
    pub success: bool,
    /// The produced output file, on success.
    pub output_path: Option<String>,
    /// The failure description, on failure.
    pub error_message: Option<String>,
    /// Wall-clock processing time in milliseconds.
    pub duration_ms: f64,
    /// The stages that completed, in order.
    pub stages_completed: Vec<PipelineStage>,
}

impl PipelineOutcome {
    /// Creates a successful outcome.
    #[must_use]
    pub fn succeeded(
        output_path: impl Into<String>,
        duration_ms: f64,
        stages_completed: Vec<PipelineStage>,
    ) -> Self {
        Self {
            success: true,
            output_path: Some(output_path.into()),
            error_message: None,
            duration_ms,
            stages_completed,
        }
    }

    /// Creates a failed outcome.
    #[must_use]
    pub fn failed(
        error_message: impl Into<String>,
        duration_ms: f64,
        stages_completed: Vec<PipelineStage>,
    ) -> Self {
        Self {
            success: false,
            output_path: None,
            error_message: Some(error_message.into()),
            duration_ms,
            stages_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending_at_first_stage() {
        let job = Job::new("/media/talk.mp4", "es");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_stage, PipelineStage::Validation);
        assert!((job.progress - 0.0).abs() < f64::EPSILON);
        assert!(job.completed_at.is_none());
        assert!(!job.is_finished());
    }

    #[test]
    fn test_job_ids_are_unique_and_prefixed() {
        let a = generate_job_id();
        let b = generate_job_id();
        assert_ne!(a, b);
        assert!(a.starts_with("job_"));
        assert_eq!(a.len(), "job_".len() + 12);
    }

    #[test]
    fn test_status_classification() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_worker_id_is_not_serialized() {
        let mut job = Job::new("/media/talk.mp4", "es");
        job.worker_id = Some("worker_1".to_string());

        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("worker_id").is_none());

        let restored: Job = serde_json::from_value(json).unwrap();
        assert!(restored.worker_id.is_none());
        assert_eq!(restored.id, job.id);
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = PipelineOutcome::succeeded("/out/talk_es_dubbed.mp4", 120.0, vec![]);
        assert!(ok.success);
        assert!(ok.error_message.is_none());

        let failed = PipelineOutcome::failed("upstream failure", 80.0, vec![]);
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("upstream failure"));
    }
}
