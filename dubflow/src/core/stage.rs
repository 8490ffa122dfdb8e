//! The ordered pipeline stage enum and the stage-function contract.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::Job;
use crate::errors::DubflowError;

/// The result payload a stage function produces.
pub type StageOutput = HashMap<String, serde_json::Value>;

/// A pluggable stage function: takes the job, returns a result payload.
///
/// Stage functions must be idempotent-safe: retry and circuit-breaker
/// policies may re-invoke them with the same job state.
pub type StageFn =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<StageOutput, DubflowError>> + Send + Sync>;

/// One ordered step of a dubbing job's pipeline.
///
/// The declaration order is the execution order; ordinal position computes
/// how far a job has progressed. `Completed` and `Failed` are terminal
/// bookkeeping stages, never dispatched to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Input file validation and metadata probing.
    Validation,
    /// Audio track extraction from the source media.
    Extraction,
    /// Speech-to-text transcription.
    Transcription,
    /// Text translation into the target language.
    Translation,
    /// Speech synthesis of the translated text.
    Synthesis,
    /// Timing alignment of synthesized audio against the original.
    Synchronization,
    /// Muxing the dubbed audio back into the video.
    Assembly,
    /// Writing the final output file.
    Output,
    /// Terminal: the job finished successfully.
    Completed,
    /// Terminal: the job failed.
    Failed,
}

impl PipelineStage {
    /// The work stages, in execution order.
    pub const WORK_STAGES: [Self; 8] = [
        Self::Validation,
        Self::Extraction,
        Self::Transcription,
        Self::Translation,
        Self::Synthesis,
        Self::Synchronization,
        Self::Assembly,
        Self::Output,
    ];

    /// Returns the zero-based position among the work stages, or `None`
    /// for the terminal stages.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        Self::WORK_STAGES.iter().position(|s| s == self)
    }

    /// Returns true for the terminal `Completed`/`Failed` stages.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The logical service name this stage is registered under in the
    /// fault-tolerance registry.
    #[must_use]
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Validation => "file_validation",
            Self::Extraction => "audio_extraction",
            Self::Transcription => "speech_to_text",
            Self::Translation => "translation",
            Self::Synthesis => "text_to_speech",
            Self::Synchronization => "audio_processing",
            Self::Assembly => "video_assembly",
            Self::Output => "output_generation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Extraction => write!(f, "extraction"),
            Self::Transcription => write!(f, "transcription"),
            Self::Translation => write!(f, "translation"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Synchronization => write!(f, "synchronization"),
            Self::Assembly => write!(f, "assembly"),
            Self::Output => write!(f, "output"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
