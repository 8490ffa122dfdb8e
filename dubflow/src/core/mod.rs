//! Core data model: job records, the ordered stage enum, and the
//! stage-function contract.

mod job;
mod stage;

pub use job::{generate_job_id, Job, JobStatus, PipelineOutcome};
pub use stage::{PipelineStage, StageFn, StageOutput};
