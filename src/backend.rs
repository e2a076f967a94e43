//! Contract with the remote execution backend.
//!
//! The scheduler consumes the backend through this trait only; concrete
//! adapters (a Dask-like cluster gateway, a test fake) live outside the core
//! scheduling logic. All operations are expected to be idempotent enough to
//! survive a re-run of the same scheduling pass.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{ClusterId, JobId, NodeId, ProjectId, RunMetadata, TaskImage, UserId};
use crate::run_state::BackendTaskState;

/// Wake-up hook handed to the backend at submission time; invoked (possibly
/// from another thread) when a submitted task finishes remotely, so the
/// manager can schedule the next pass without waiting for the sweep.
pub type SchedulerCallback = Arc<dyn Fn() + Send + Sync>;

/// One task handed to the backend for execution.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub node_id: NodeId,
    pub image: TaskImage,
}

/// Correlation returned by the backend for a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTask {
    pub node_id: NodeId,
    pub job_id: JobId,
}

/// Output ports of a finished task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub ports: serde_json::Map<String, Value>,
}

/// An acquired compute cluster, ready to receive submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHandle {
    pub cluster_id: ClusterId,
}

#[derive(Debug, thiserror::Error)]
pub enum ComputeBackendError {
    /// Transient: the backend scheduler is unreachable. Retry next pass.
    #[error("computational backend is not connected")]
    NotConnected,

    /// Transient: the on-demand cluster is still being provisioned.
    #[error("on-demand cluster is not ready yet: {0}")]
    OnDemandClusterNotReady(String),

    /// Fatal for the run: no cluster can ever be provisioned.
    #[error("clusters keeper is unavailable")]
    ClustersKeeperUnavailable,

    /// Result requested before the task completed.
    #[error("results for job {0} are not ready")]
    ResultsNotReady(JobId),

    /// The backend has no memory of the job; treated as a lost task.
    #[error("job {0} is unknown to the backend")]
    TaskNotFound(JobId),

    /// The remote computation itself failed; message surfaced to the user.
    #[error("task execution failed: {0}")]
    TaskFailed(String),

    #[error("task submission failed: {0}")]
    Submission(String),
}

impl ComputeBackendError {
    /// Errors worth an in-pass retry; everything else is handled by state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}

/// Remote execution engine operations consumed by the scheduling pass.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Provision or look up the cluster for a run. Static clusters resolve
    /// immediately; on-demand clusters may answer `OnDemandClusterNotReady`
    /// until provisioned.
    async fn get_or_create_cluster(
        &self,
        user_id: UserId,
        cluster_id: ClusterId,
        on_demand: bool,
    ) -> Result<ClusterHandle, ComputeBackendError>;

    /// Submit tasks for execution. Only tasks without a `job_id` are ever
    /// passed here, so repeated calls submit disjoint sets.
    async fn send_computation_tasks(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        cluster: ClusterHandle,
        tasks: &[TaskSubmission],
        callback: SchedulerCallback,
        metadata: &RunMetadata,
    ) -> Result<Vec<SubmittedTask>, ComputeBackendError>;

    /// Batched status poll; the result preserves the input ordering.
    async fn get_tasks_status(
        &self,
        job_ids: &[JobId],
    ) -> Result<Vec<BackendTaskState>, ComputeBackendError>;

    /// Fetch the output of a finished task. Fails with `ResultsNotReady`
    /// before completion, `TaskFailed` for erred tasks and `TaskNotFound`
    /// when the backend lost the job.
    async fn get_task_result(&self, job_id: &JobId) -> Result<TaskOutput, ComputeBackendError>;

    /// Abort a submitted task. Idempotent; a no-op once the task finished.
    async fn abort_computation_task(&self, job_id: &JobId) -> Result<(), ComputeBackendError>;

    /// Release the backend's memory of a finished task once its result has
    /// been processed.
    async fn release_task_result(&self, job_id: &JobId) -> Result<(), ComputeBackendError>;

    /// Delete partially written output/log artifacts of a failed or aborted
    /// task so downstream nodes never read stale data.
    async fn clean_output_artifacts(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> Result<(), ComputeBackendError>;
}
