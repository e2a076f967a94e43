//! Error taxonomy exposed by the scheduler API.

use crate::backend::ComputeBackendError;
use crate::models::ProjectId;
use crate::store::StoreError;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A non-terminal run already exists for the project.
    #[error("a pipeline run is already in progress for project {project_id}")]
    PipelineAlreadyRunning { project_id: ProjectId },

    /// No non-terminal run exists for the project.
    #[error("no pipeline run found for project {project_id}")]
    PipelineNotFound { project_id: ProjectId },

    /// The project's DAG is missing, empty or inconsistent with its task rows.
    #[error("pipeline for project {project_id} is invalid: {reason}")]
    InvalidPipeline { project_id: ProjectId, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] ComputeBackendError),
}
