//! Persisted scheduler models: pipeline runs and their task rows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run_state::{RunState, TaskState};

pub type UserId = i64;
pub type ClusterId = i64;
pub type Iteration = i64;
pub type ProjectId = Uuid;
pub type NodeId = Uuid;

/// Backend-side identifier of a submitted task.
pub type JobId = String;

/// Run-scoped labels forwarded to billing/telemetry events.
pub type RunMetadata = HashMap<String, serde_json::Value>;

/// Identity of one scheduling unit: a single run of a project's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub iteration: Iteration,
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.project_id, self.iteration)
    }
}

/// Executable descriptor of a task: container image plus resource flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskImage {
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(default)]
    pub requires_mpi: bool,
}

/// Only computational nodes participate in backend scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeClass {
    Computational,
    Frontend,
}

impl NodeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Computational => "COMPUTATIONAL",
            Self::Frontend => "FRONTEND",
        }
    }
}

impl std::str::FromStr for NodeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPUTATIONAL" => Ok(Self::Computational),
            "FRONTEND" => Ok(Self::Frontend),
            other => Err(format!("unknown node class: {other}")),
        }
    }
}

/// One execution attempt of a project's pipeline.
///
/// Mutated exclusively by the scheduling pass; terminal runs are never
/// written again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub iteration: Iteration,
    pub cluster_id: ClusterId,
    pub use_on_demand_cluster: bool,
    pub state: RunState,
    pub metadata: RunMetadata,
    pub cancellation_requested: bool,
    /// Set while the run is stuck waiting for an on-demand cluster; used for
    /// the cluster-wait timeout.
    pub cluster_wait_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn key(&self) -> RunKey {
        RunKey {
            user_id: self.user_id,
            project_id: self.project_id,
            iteration: self.iteration,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One DAG node's execution record within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTask {
    pub project_id: ProjectId,
    pub node_id: NodeId,
    /// Set exactly once, at submission, and stable thereafter.
    pub job_id: Option<JobId>,
    pub image: TaskImage,
    pub state: TaskState,
    /// Null until the first progress event; clamped to [0, 1], monotonic.
    pub progress: Option<f32>,
    pub node_class: NodeClass,
    /// Guards the one-shot "service started" messages across passes and
    /// processes.
    pub started_emitted: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl PipelineTask {
    /// Fresh authoring-time task row.
    pub fn new(project_id: ProjectId, node_id: NodeId, image: TaskImage) -> Self {
        Self {
            project_id,
            node_id,
            job_id: None,
            image,
            state: TaskState::NotStarted,
            progress: None,
            node_class: NodeClass::Computational,
            started_emitted: false,
            last_heartbeat: None,
            started_at: None,
            ended_at: None,
            errors: Vec::new(),
        }
    }

    pub fn is_computational(&self) -> bool {
        self.node_class == NodeClass::Computational
    }

    /// Absorb a raw progress value: clamp into [0, 1] and never regress.
    pub fn absorb_progress(&mut self, raw: f32) -> f32 {
        let clamped = raw.clamp(0.0, 1.0);
        let next = match self.progress {
            Some(current) => current.max(clamped),
            None => clamped,
        };
        self.progress = Some(next);
        next
    }
}
