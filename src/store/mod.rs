//! Persistence seam for run and task rows.
//!
//! The store is the single source of truth: a scheduling pass reads a
//! snapshot at pass-start and commits all its writes in one transaction at
//! pass-end, so concurrent readers never observe a half-updated run.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::dag::PipelineDag;
use crate::models::{
    ClusterId, JobId, PipelineRun, PipelineTask, ProjectId, RunKey, RunMetadata, UserId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A non-terminal run already exists for the project.
    #[error("project {0} already has an active run")]
    ActiveRunExists(ProjectId),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// All row changes of one scheduling pass, applied atomically.
#[derive(Debug, Clone)]
pub struct PassUpdate {
    pub run: PipelineRun,
    /// Only the task rows that actually changed during the pass.
    pub tasks: Vec<PipelineTask>,
}

/// Row-level access to `comp_runs`, `comp_tasks` and `comp_pipelines`.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get_run(&self, key: &RunKey) -> StoreResult<Option<PipelineRun>>;

    /// Latest non-terminal run of a project, if any.
    async fn find_active_run(&self, project_id: ProjectId) -> StoreResult<Option<PipelineRun>>;

    /// All non-terminal runs, for the safety-net sweep.
    async fn list_active_runs(&self) -> StoreResult<Vec<PipelineRun>>;

    /// Create a run in `Published` state, allocating the next iteration for
    /// the project. Fails with `ActiveRunExists` if a non-terminal run
    /// already exists.
    async fn create_run(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        cluster_id: ClusterId,
        use_on_demand_cluster: bool,
        metadata: RunMetadata,
    ) -> StoreResult<PipelineRun>;

    async fn set_cancellation_requested(&self, key: &RunKey) -> StoreResult<()>;

    async fn get_dag(&self, project_id: ProjectId) -> StoreResult<Option<PipelineDag>>;

    /// Authoring side: store or replace a project's DAG.
    async fn upsert_dag(&self, project_id: ProjectId, dag: PipelineDag) -> StoreResult<()>;

    async fn list_tasks(&self, project_id: ProjectId) -> StoreResult<Vec<PipelineTask>>;

    /// Authoring side and the out-of-band progress handler.
    async fn upsert_task(&self, task: PipelineTask) -> StoreResult<()>;

    async fn get_task_by_job_id(&self, job_id: &JobId) -> StoreResult<Option<PipelineTask>>;

    /// Flip a project's task rows to `Published` when a new run starts.
    async fn mark_tasks_published(&self, project_id: ProjectId) -> StoreResult<()>;

    /// Persist the outcome of one scheduling pass transactionally.
    async fn apply_pass_update(&self, update: PassUpdate) -> StoreResult<()>;
}
