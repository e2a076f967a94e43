//! Gantry - computational pipeline scheduler.
//!
//! Drives DAGs of computational tasks through execution on a remote elastic
//! compute backend. Authoritative state lives in the relational store; every
//! scheduling pass is resumable from stored rows alone.

pub mod backend;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod manager;
pub mod models;
pub mod retry;
pub mod run_state;
pub mod store;

pub use backend::{
    ClusterHandle, ComputeBackend, ComputeBackendError, SchedulerCallback, SubmittedTask,
    TaskOutput, TaskSubmission,
};
pub use config::Config;
pub use dag::PipelineDag;
pub use engine::{PassOutcome, SchedulingEngine, noop_wake_up};
pub use errors::{SchedulerError, SchedulerResult};
pub use events::{
    EventPublisher, LogLevel, PublishError, RecordingPublisher, SchedulerEvent,
    resource_tracking_run_id,
};
pub use manager::{SchedulerHandle, SchedulerManager, spawn_scheduler_manager};
pub use models::{
    ClusterId, Iteration, JobId, NodeClass, NodeId, PipelineRun, PipelineTask, ProjectId,
    RunKey, RunMetadata, TaskImage, UserId,
};
pub use retry::RetryPolicy;
pub use run_state::{BackendTaskState, RunState, TaskState, advance_run_state, aggregate_run_state};
pub use store::{MemoryStore, PassUpdate, PipelineStore, PostgresStore, StoreError, StoreResult};
