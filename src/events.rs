//! Bus messages emitted by the scheduler and the publisher seam.
//!
//! Publishing is fire-and-forget: the authoritative outcome of a pass is the
//! persisted store state, so a publish failure is logged and counted but
//! never fails the pass.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Iteration, NodeId, ProjectId, UserId};
use crate::run_state::{RunState, TaskState};

/// Correlation id tying resource-tracking messages of one task execution
/// together across started/heartbeat/stopped.
pub fn resource_tracking_run_id(
    user_id: UserId,
    project_id: ProjectId,
    node_id: NodeId,
    iteration: Iteration,
) -> String {
    format!("comp_{user_id}_{project_id}_{node_id}_{iteration}")
}

/// Severity of a user-facing pipeline log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// Messages published on the bus. The topic is the message-type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// Instrumentation: a computational service started executing.
    ServiceStarted {
        user_id: UserId,
        project_id: ProjectId,
        node_id: NodeId,
        service_key: String,
        service_version: String,
    },
    /// Instrumentation: a computational service reached a terminal state.
    ServiceStopped {
        user_id: UserId,
        project_id: ProjectId,
        node_id: NodeId,
        service_key: String,
        service_version: String,
        final_state: TaskState,
    },
    ResourceTrackingStarted {
        service_run_id: String,
        user_id: UserId,
        project_id: ProjectId,
        node_id: NodeId,
        service_key: String,
        service_version: String,
    },
    ResourceTrackingHeartbeat {
        service_run_id: String,
        emitted_at: DateTime<Utc>,
    },
    ResourceTrackingStopped {
        service_run_id: String,
        /// False when the platform itself (not the user code) caused the stop.
        platform_ok: bool,
    },
    /// Outcome of one scheduling pass, consumed by autoscaling/monitoring.
    SchedulingStatus {
        user_id: UserId,
        project_id: ProjectId,
        iteration: Iteration,
        run_state: RunState,
        submitted: usize,
        in_flight: usize,
    },
    TaskProgress {
        project_id: ProjectId,
        node_id: NodeId,
        progress: f32,
    },
    /// User-facing log line attached to the project.
    PipelineLog {
        user_id: UserId,
        project_id: ProjectId,
        level: LogLevel,
        message: String,
    },
}

impl SchedulerEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => "InstrumentationMessage",
            Self::ResourceTrackingStarted { .. } => "ResourceTrackingStartedMessage",
            Self::ResourceTrackingHeartbeat { .. } => "ResourceTrackingHeartbeatMessage",
            Self::ResourceTrackingStopped { .. } => "ResourceTrackingStoppedMessage",
            Self::SchedulingStatus { .. } => "SchedulingStatusMessage",
            Self::TaskProgress { .. } => "TaskProgressMessage",
            Self::PipelineLog { .. } => "PipelineLogMessage",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("{0}")]
    Message(String),
}

/// Topic-based publish seam toward the message bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: SchedulerEvent) -> Result<(), PublishError>;
}

/// Publisher that records events in memory, for tests and local runs.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().expect("events poisoned").clone()
    }

    pub fn events_on_topic(&self, topic: &str) -> Vec<SchedulerEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.topic() == topic)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("events poisoned").clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: SchedulerEvent) -> Result<(), PublishError> {
        self.events.lock().expect("events poisoned").push(event);
        Ok(())
    }
}
