//! Shared fixtures for the scheduler integration tests: a scriptable compute
//! backend fake plus pipeline-building helpers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use gantry::{
    BackendTaskState, ClusterHandle, ClusterId, ComputeBackend, ComputeBackendError, JobId,
    MemoryStore, NodeId, PipelineDag, PipelineStore, PipelineTask, ProjectId, RunKey, RunMetadata,
    SchedulerCallback, SubmittedTask, TaskImage, TaskOutput, TaskSubmission, UserId,
};

pub const TEST_USER: UserId = 7;

/// Scripted response for a cluster acquisition attempt.
#[derive(Debug, Clone)]
pub enum ClusterOutcome {
    Ready,
    NotReady(String),
    KeeperDown,
    NotConnected,
}

#[derive(Default)]
struct FakeInner {
    statuses: HashMap<JobId, BackendTaskState>,
    error_messages: HashMap<JobId, String>,
    submissions: Vec<SubmittedTask>,
    submission_counts: HashMap<NodeId, usize>,
    aborted: Vec<JobId>,
    released: Vec<JobId>,
    cleaned: Vec<(ProjectId, NodeId)>,
    cluster_script: VecDeque<ClusterOutcome>,
    auto_success: bool,
    disconnected: bool,
}

/// In-memory compute backend with scriptable statuses and failure modes.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<FakeInner>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submitted job immediately reports success.
    pub fn with_auto_success() -> Self {
        let backend = Self::new();
        backend.inner.lock().unwrap().auto_success = true;
        backend
    }

    pub fn set_status(&self, job_id: &JobId, status: BackendTaskState) {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(job_id.clone(), status);
    }

    pub fn set_all_statuses(&self, status: BackendTaskState) {
        let mut inner = self.inner.lock().unwrap();
        let jobs: Vec<JobId> = inner.statuses.keys().cloned().collect();
        for job in jobs {
            inner.statuses.insert(job, status);
        }
    }

    /// Make `get_task_result` surface this message for the job.
    pub fn set_error_message(&self, job_id: &JobId, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .error_messages
            .insert(job_id.clone(), message.to_string());
    }

    pub fn push_cluster_outcome(&self, outcome: ClusterOutcome) {
        self.inner.lock().unwrap().cluster_script.push_back(outcome);
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.inner.lock().unwrap().disconnected = disconnected;
    }

    pub fn submissions(&self) -> Vec<SubmittedTask> {
        self.inner.lock().unwrap().submissions.clone()
    }

    pub fn submission_count(&self, node_id: &NodeId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .submission_counts
            .get(node_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn job_for(&self, node_id: &NodeId) -> Option<JobId> {
        self.inner
            .lock()
            .unwrap()
            .submissions
            .iter()
            .find(|s| s.node_id == *node_id)
            .map(|s| s.job_id.clone())
    }

    pub fn aborted_jobs(&self) -> Vec<JobId> {
        self.inner.lock().unwrap().aborted.clone()
    }

    pub fn released_jobs(&self) -> Vec<JobId> {
        self.inner.lock().unwrap().released.clone()
    }

    pub fn cleaned_artifacts(&self) -> Vec<(ProjectId, NodeId)> {
        self.inner.lock().unwrap().cleaned.clone()
    }
}

#[async_trait]
impl ComputeBackend for FakeBackend {
    async fn get_or_create_cluster(
        &self,
        _user_id: UserId,
        cluster_id: ClusterId,
        _on_demand: bool,
    ) -> Result<ClusterHandle, ComputeBackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disconnected {
            return Err(ComputeBackendError::NotConnected);
        }
        match inner.cluster_script.pop_front() {
            None | Some(ClusterOutcome::Ready) => Ok(ClusterHandle { cluster_id }),
            Some(ClusterOutcome::NotReady(reason)) => {
                Err(ComputeBackendError::OnDemandClusterNotReady(reason))
            }
            Some(ClusterOutcome::KeeperDown) => {
                Err(ComputeBackendError::ClustersKeeperUnavailable)
            }
            Some(ClusterOutcome::NotConnected) => Err(ComputeBackendError::NotConnected),
        }
    }

    async fn send_computation_tasks(
        &self,
        _user_id: UserId,
        _project_id: ProjectId,
        _cluster: ClusterHandle,
        tasks: &[TaskSubmission],
        callback: SchedulerCallback,
        _metadata: &RunMetadata,
    ) -> Result<Vec<SubmittedTask>, ComputeBackendError> {
        let auto_success;
        let mut submitted = Vec::with_capacity(tasks.len());
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.disconnected {
                return Err(ComputeBackendError::NotConnected);
            }
            auto_success = inner.auto_success;
            for task in tasks {
                let count = inner.submission_counts.entry(task.node_id).or_insert(0);
                *count += 1;
                let job_id = format!("job-{}-{}", task.node_id, count);
                let status = if auto_success {
                    BackendTaskState::Success
                } else {
                    // a real backend cannot tell queued from accepted
                    BackendTaskState::PendingOrStarted
                };
                inner.statuses.insert(job_id.clone(), status);
                let entry = SubmittedTask {
                    node_id: task.node_id,
                    job_id,
                };
                inner.submissions.push(entry.clone());
                submitted.push(entry);
            }
        }
        if auto_success {
            // tasks "finished" immediately: fire the wake-up like a real
            // backend completion event would
            callback();
        }
        Ok(submitted)
    }

    async fn get_tasks_status(
        &self,
        job_ids: &[JobId],
    ) -> Result<Vec<BackendTaskState>, ComputeBackendError> {
        let inner = self.inner.lock().unwrap();
        if inner.disconnected {
            return Err(ComputeBackendError::NotConnected);
        }
        Ok(job_ids
            .iter()
            .map(|job| {
                inner
                    .statuses
                    .get(job)
                    .copied()
                    .unwrap_or(BackendTaskState::Lost)
            })
            .collect())
    }

    async fn get_task_result(&self, job_id: &JobId) -> Result<TaskOutput, ComputeBackendError> {
        let inner = self.inner.lock().unwrap();
        match inner.statuses.get(job_id) {
            Some(BackendTaskState::Success) => {
                let mut ports = serde_json::Map::new();
                ports.insert("out_1".to_string(), serde_json::json!(42));
                Ok(TaskOutput { ports })
            }
            Some(BackendTaskState::Erred) => Err(ComputeBackendError::TaskFailed(
                inner
                    .error_messages
                    .get(job_id)
                    .cloned()
                    .unwrap_or_else(|| "computation failed".to_string()),
            )),
            Some(BackendTaskState::Aborted) => {
                Err(ComputeBackendError::TaskFailed("task was cancelled".to_string()))
            }
            Some(BackendTaskState::Pending) | Some(BackendTaskState::PendingOrStarted) => {
                Err(ComputeBackendError::ResultsNotReady(job_id.clone()))
            }
            Some(BackendTaskState::Lost) | None => {
                Err(ComputeBackendError::TaskNotFound(job_id.clone()))
            }
        }
    }

    async fn abort_computation_task(&self, job_id: &JobId) -> Result<(), ComputeBackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted.push(job_id.clone());
        if let Some(status) = inner.statuses.get_mut(job_id)
            && !matches!(status, BackendTaskState::Success)
        {
            *status = BackendTaskState::Aborted;
        }
        Ok(())
    }

    async fn release_task_result(&self, job_id: &JobId) -> Result<(), ComputeBackendError> {
        self.inner.lock().unwrap().released.push(job_id.clone());
        Ok(())
    }

    async fn clean_output_artifacts(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> Result<(), ComputeBackendError> {
        self.inner.lock().unwrap().cleaned.push((project_id, node_id));
        Ok(())
    }
}

pub fn test_image() -> TaskImage {
    TaskImage {
        name: "registry/comp/fem-solver".to_string(),
        tag: "2.1.0".to_string(),
        requires_gpu: false,
        requires_mpi: false,
    }
}

/// Author a pipeline: `n` computational task rows plus a DAG over the given
/// edge list (indices into the returned node list).
pub async fn author_pipeline(
    store: &MemoryStore,
    n: usize,
    edges: &[(usize, usize)],
) -> (ProjectId, Vec<NodeId>) {
    let project_id = Uuid::new_v4();
    let nodes: Vec<NodeId> = (0..n).map(|_| Uuid::new_v4()).collect();
    let edge_ids: Vec<(NodeId, NodeId)> = edges
        .iter()
        .map(|(from, to)| (nodes[*from], nodes[*to]))
        .collect();
    store
        .upsert_dag(project_id, PipelineDag::from_edges(nodes.clone(), &edge_ids))
        .await
        .expect("dag upsert");
    for node_id in &nodes {
        store
            .upsert_task(PipelineTask::new(project_id, *node_id, test_image()))
            .await
            .expect("task upsert");
    }
    (project_id, nodes)
}

/// Create a run the way the manager does: run row plus published task rows.
pub async fn start_run(store: &MemoryStore, project_id: ProjectId) -> RunKey {
    start_run_with_cluster(store, project_id, false).await
}

pub async fn start_run_with_cluster(
    store: &MemoryStore,
    project_id: ProjectId,
    use_on_demand_cluster: bool,
) -> RunKey {
    let run = store
        .create_run(TEST_USER, project_id, 0, use_on_demand_cluster, RunMetadata::new())
        .await
        .expect("run creation");
    store
        .mark_tasks_published(project_id)
        .await
        .expect("publish tasks");
    run.key()
}
