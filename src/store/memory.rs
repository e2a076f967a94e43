//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{PassUpdate, PipelineStore, StoreError, StoreResult};
use crate::dag::PipelineDag;
use crate::models::{
    ClusterId, JobId, NodeId, PipelineRun, PipelineTask, ProjectId, RunKey, RunMetadata, UserId,
};
use crate::run_state::RunState;

#[derive(Default)]
struct Inner {
    runs: HashMap<RunKey, PipelineRun>,
    tasks: HashMap<(ProjectId, NodeId), PipelineTask>,
    dags: HashMap<ProjectId, PipelineDag>,
}

/// Store that keeps every row behind one mutex; commits are naturally atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every run row, newest iteration first. Test helper.
    pub fn runs(&self) -> Vec<PipelineRun> {
        let inner = self.inner.lock().expect("store poisoned");
        let mut runs: Vec<_> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.iteration));
        runs
    }

    /// Snapshot of one task row. Test helper.
    pub fn task(&self, project_id: ProjectId, node_id: NodeId) -> Option<PipelineTask> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.tasks.get(&(project_id, node_id)).cloned()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn get_run(&self, key: &RunKey) -> StoreResult<Option<PipelineRun>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.runs.get(key).cloned())
    }

    async fn find_active_run(&self, project_id: ProjectId) -> StoreResult<Option<PipelineRun>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .runs
            .values()
            .filter(|r| r.project_id == project_id && !r.is_terminal())
            .max_by_key(|r| r.iteration)
            .cloned())
    }

    async fn list_active_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .runs
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn create_run(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        cluster_id: ClusterId,
        use_on_demand_cluster: bool,
        metadata: RunMetadata,
    ) -> StoreResult<PipelineRun> {
        let mut inner = self.inner.lock().expect("store poisoned");
        if inner
            .runs
            .values()
            .any(|r| r.project_id == project_id && !r.is_terminal())
        {
            return Err(StoreError::ActiveRunExists(project_id));
        }
        let iteration = inner
            .runs
            .values()
            .filter(|r| r.project_id == project_id)
            .map(|r| r.iteration)
            .max()
            .unwrap_or(0)
            + 1;
        let run = PipelineRun {
            user_id,
            project_id,
            iteration,
            cluster_id,
            use_on_demand_cluster,
            state: RunState::Published,
            metadata,
            cancellation_requested: false,
            cluster_wait_since: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        inner.runs.insert(run.key(), run.clone());
        Ok(run)
    }

    async fn set_cancellation_requested(&self, key: &RunKey) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        match inner.runs.get_mut(key) {
            Some(run) => {
                run.cancellation_requested = true;
                Ok(())
            }
            None => Err(StoreError::Message(format!("run {key} not found"))),
        }
    }

    async fn get_dag(&self, project_id: ProjectId) -> StoreResult<Option<PipelineDag>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.dags.get(&project_id).cloned())
    }

    async fn upsert_dag(&self, project_id: ProjectId, dag: PipelineDag) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.dags.insert(project_id, dag);
        Ok(())
    }

    async fn list_tasks(&self, project_id: ProjectId) -> StoreResult<Vec<PipelineTask>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn upsert_task(&self, task: PipelineTask) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.tasks.insert((task.project_id, task.node_id), task);
        Ok(())
    }

    async fn get_task_by_job_id(&self, job_id: &JobId) -> StoreResult<Option<PipelineTask>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .tasks
            .values()
            .find(|t| t.job_id.as_ref() == Some(job_id))
            .cloned())
    }

    async fn mark_tasks_published(&self, project_id: ProjectId) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        for task in inner
            .tasks
            .values_mut()
            .filter(|t| t.project_id == project_id)
        {
            task.state = crate::run_state::TaskState::Published;
            task.job_id = None;
            task.progress = None;
            task.started_emitted = false;
            task.last_heartbeat = None;
            task.started_at = None;
            task.ended_at = None;
            task.errors.clear();
        }
        Ok(())
    }

    async fn apply_pass_update(&self, update: PassUpdate) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = update.run.key();
        inner.runs.insert(key, update.run);
        for task in update.tasks {
            inner.tasks.insert((task.project_id, task.node_id), task);
        }
        Ok(())
    }
}
