//! The reconciliation engine: one scheduling pass per invocation.
//!
//! A pass loads the run and its task rows, diffs in-flight tasks against the
//! backend's view, decides what to submit/abort/finalize, recomputes the
//! run's aggregate state and commits everything in a single transaction. The
//! pass holds no state of its own across invocations — crash recovery is just
//! the normal pass applied to the stored rows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::backend::{ComputeBackend, ComputeBackendError, SchedulerCallback, TaskSubmission};
use crate::config::Config;
use crate::errors::SchedulerResult;
use crate::events::{EventPublisher, LogLevel, SchedulerEvent, resource_tracking_run_id};
use crate::models::{JobId, NodeId, PipelineRun, PipelineTask, RunKey};
use crate::retry::RetryPolicy;
use crate::run_state::{BackendTaskState, RunState, TaskState, advance_run_state};
use crate::store::{PassUpdate, PipelineStore};
use crate::dag::PipelineDag;

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing to do: the run is gone or already terminal.
    Skipped,
    /// The run reached a terminal state during this pass.
    Settled(RunState),
    /// Work remains; another pass should follow.
    InProgress(RunState),
}

impl PassOutcome {
    pub fn needs_another_pass(self) -> bool {
        matches!(self, Self::InProgress(_))
    }
}

/// Drives pipeline runs through the backend, one pass at a time.
pub struct SchedulingEngine {
    store: Arc<dyn PipelineStore>,
    backend: Arc<dyn ComputeBackend>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    heartbeat_interval: chrono::Duration,
    cluster_wait_timeout: chrono::Duration,
}

/// Wake-up hook that does nothing; for manual passes and tests.
pub fn noop_wake_up() -> SchedulerCallback {
    Arc::new(|| {})
}

impl SchedulingEngine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        backend: Arc<dyn ComputeBackend>,
        publisher: Arc<dyn EventPublisher>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            backend,
            publisher,
            retry: config.backend_retry_policy(),
            heartbeat_interval: config.heartbeat_interval(),
            cluster_wait_timeout: config.waiting_for_cluster_timeout(),
        }
    }

    /// Execute one scheduling pass for the given run.
    pub async fn apply(
        &self,
        key: RunKey,
        wake_up: SchedulerCallback,
    ) -> SchedulerResult<PassOutcome> {
        let Some(run) = self.store.get_run(&key).await? else {
            debug!(run = %key, "no run row, nothing to schedule");
            return Ok(PassOutcome::Skipped);
        };
        if run.state.is_terminal() {
            debug!(run = %key, state = %run.state, "run already settled");
            return Ok(PassOutcome::Skipped);
        }

        let Some(dag) = self.store.get_dag(run.project_id).await? else {
            warn!(run = %key, "pipeline definition is gone, aborting run");
            return self.finalize_defective_run(run).await;
        };

        let tasks: HashMap<NodeId, PipelineTask> = self
            .store
            .list_tasks(run.project_id)
            .await?
            .into_iter()
            .filter(|t| t.is_computational() && dag.contains(&t.node_id))
            .map(|t| (t.node_id, t))
            .collect();

        if tasks.is_empty() {
            warn!(run = %key, "pipeline has no computational tasks, aborting run");
            return self.finalize_defective_run(run).await;
        }
        if dag.nodes().any(|n| !tasks.contains_key(n)) {
            warn!(run = %key, "task rows do not cover the pipeline dag, aborting run");
            return self.finalize_defective_run(run).await;
        }

        let mut pass = Pass {
            engine: self,
            run,
            dag,
            tasks,
            changed: HashSet::new(),
            submitted: 0,
            wake_up,
        };

        pass.update_states_from_backend().await?;
        pass.abort_tasks_downstream_of_failed();
        if pass.run.cancellation_requested {
            pass.schedule_tasks_to_stop().await;
        } else {
            pass.schedule_tasks_to_start().await?;
            pass.fail_if_waiting_for_cluster_too_long().await;
        }
        pass.send_heartbeats().await;
        pass.finalize().await
    }

    /// Out-of-band progress delivery, keyed by the backend's job id.
    ///
    /// Safe to run on a different worker than the polling pass: the one-shot
    /// "started" messages are guarded by the persisted `started_emitted`
    /// flag, not by in-process state.
    pub async fn on_progress_event(&self, job_id: &JobId, raw: f32) -> SchedulerResult<()> {
        let Some(mut task) = self.store.get_task_by_job_id(job_id).await? else {
            debug!(job_id = %job_id, "progress event for unknown job, dropping");
            return Ok(());
        };
        if task.state.is_terminal() {
            return Ok(());
        }

        let progress = task.absorb_progress(raw);

        if !task.started_emitted {
            let Some(run) = self.store.find_active_run(task.project_id).await? else {
                debug!(job_id = %job_id, "progress event without an active run, storing progress only");
                self.store.upsert_task(task).await?;
                return Ok(());
            };
            task.state = TaskState::Started;
            task.started_emitted = true;
            task.started_at = Some(Utc::now());
            self.emit_task_started(&run, &task).await;
        }

        self.publish(SchedulerEvent::TaskProgress {
            project_id: task.project_id,
            node_id: task.node_id,
            progress,
        })
        .await;
        self.store.upsert_task(task).await?;
        Ok(())
    }

    /// A run whose pipeline definition is missing or inconsistent can never
    /// progress: finalize it aborted together with its unsettled tasks.
    async fn finalize_defective_run(&self, mut run: PipelineRun) -> SchedulerResult<PassOutcome> {
        let now = Utc::now();
        let mut aborted = Vec::new();
        for mut task in self.store.list_tasks(run.project_id).await? {
            if task.is_computational() && !task.state.is_terminal() {
                task.state = TaskState::Aborted;
                task.progress = Some(1.0);
                task.ended_at = Some(now);
                aborted.push(task);
            }
        }
        run.state = RunState::Aborted;
        run.ended_at = Some(now);
        self.store
            .apply_pass_update(PassUpdate {
                run: run.clone(),
                tasks: aborted,
            })
            .await?;
        self.publish(SchedulerEvent::SchedulingStatus {
            user_id: run.user_id,
            project_id: run.project_id,
            iteration: run.iteration,
            run_state: RunState::Aborted,
            submitted: 0,
            in_flight: 0,
        })
        .await;
        Ok(PassOutcome::Settled(RunState::Aborted))
    }

    /// Publish failures are logged and counted, never escalated: the pass's
    /// authoritative outcome is the persisted store state.
    async fn publish(&self, event: SchedulerEvent) {
        if let Err(err) = self.publisher.publish(event).await {
            metrics::counter!("gantry_publish_errors_total").increment(1);
            warn!(error = %err, "failed to publish scheduler event");
        }
    }

    async fn emit_task_started(&self, run: &PipelineRun, task: &PipelineTask) {
        self.publish(SchedulerEvent::ServiceStarted {
            user_id: run.user_id,
            project_id: task.project_id,
            node_id: task.node_id,
            service_key: task.image.name.clone(),
            service_version: task.image.tag.clone(),
        })
        .await;
        self.publish(SchedulerEvent::ResourceTrackingStarted {
            service_run_id: resource_tracking_run_id(
                run.user_id,
                task.project_id,
                task.node_id,
                run.iteration,
            ),
            user_id: run.user_id,
            project_id: task.project_id,
            node_id: task.node_id,
            service_key: task.image.name.clone(),
            service_version: task.image.tag.clone(),
        })
        .await;
    }

    async fn emit_task_stopped(
        &self,
        run: &PipelineRun,
        task: &PipelineTask,
        final_state: TaskState,
        platform_ok: bool,
    ) {
        self.publish(SchedulerEvent::ServiceStopped {
            user_id: run.user_id,
            project_id: task.project_id,
            node_id: task.node_id,
            service_key: task.image.name.clone(),
            service_version: task.image.tag.clone(),
            final_state,
        })
        .await;
        self.publish(SchedulerEvent::ResourceTrackingStopped {
            service_run_id: resource_tracking_run_id(
                run.user_id,
                task.project_id,
                task.node_id,
                run.iteration,
            ),
            platform_ok,
        })
        .await;
    }
}

/// Working state of a single scheduling pass.
struct Pass<'a> {
    engine: &'a SchedulingEngine,
    run: PipelineRun,
    dag: PipelineDag,
    tasks: HashMap<NodeId, PipelineTask>,
    changed: HashSet<NodeId>,
    submitted: usize,
    wake_up: SchedulerCallback,
}

impl Pass<'_> {
    /// Poll the backend once for every in-flight task and fold the observed
    /// states back into the task rows.
    async fn update_states_from_backend(&mut self) -> SchedulerResult<()> {
        let in_flight: Vec<(NodeId, JobId)> = self
            .tasks
            .values()
            .filter(|t| t.state.is_in_flight())
            .filter_map(|t| t.job_id.clone().map(|job| (t.node_id, job)))
            .collect();
        if in_flight.is_empty() {
            return Ok(());
        }

        let job_ids: Vec<JobId> = in_flight.iter().map(|(_, job)| job.clone()).collect();
        let poll_result = self
            .engine
            .retry
            .run("get_tasks_status", ComputeBackendError::is_transient, || {
                self.engine.backend.get_tasks_status(&job_ids)
            })
            .await;
        let statuses = match poll_result {
            Ok(statuses) => statuses,
            Err(ComputeBackendError::NotConnected) => {
                warn!(run = %self.run.key(), "backend not connected, polling deferred to next pass");
                return Ok(());
            }
            Err(ComputeBackendError::OnDemandClusterNotReady(_)) => {
                // the cluster vanished under the submitted tasks
                for (node_id, _) in &in_flight {
                    self.update_task_state(*node_id, TaskState::WaitingForCluster);
                }
                self.enter_cluster_wait();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if statuses.len() != job_ids.len() {
            error!(
                run = %self.run.key(),
                expected = job_ids.len(),
                got = statuses.len(),
                "backend returned a mismatched status batch, polling deferred"
            );
            return Ok(());
        }
        self.run.cluster_wait_since = None;

        for ((node_id, _job), backend_state) in in_flight.into_iter().zip(statuses) {
            match backend_state {
                BackendTaskState::Pending => {
                    self.update_task_state(node_id, TaskState::Pending);
                }
                BackendTaskState::PendingOrStarted => {
                    // the backend cannot tell queued from accepted; the first
                    // progress event is what flips the task to Started
                    if self.tasks[&node_id].progress.is_some() {
                        self.mark_task_started(node_id).await;
                    }
                }
                BackendTaskState::Success
                | BackendTaskState::Erred
                | BackendTaskState::Aborted
                | BackendTaskState::Lost => {
                    self.process_completed_task(node_id, backend_state).await;
                }
            }
        }
        Ok(())
    }

    /// Flip a task to Started, emitting the one-shot start messages when they
    /// were never sent (the backend can skip the progress phase entirely for
    /// very short tasks).
    async fn mark_task_started(&mut self, node_id: NodeId) {
        let run = self.run.clone();
        let task = self.tasks.get_mut(&node_id).expect("task present");
        if task.state == TaskState::Started {
            return;
        }
        task.state = TaskState::Started;
        if !task.started_emitted {
            task.started_emitted = true;
            task.started_at = Some(Utc::now());
            let snapshot = task.clone();
            self.engine.emit_task_started(&run, &snapshot).await;
        }
        self.changed.insert(node_id);
    }

    /// Resolve a task the backend reports as finished (or lost).
    async fn process_completed_task(&mut self, node_id: NodeId, observed: BackendTaskState) {
        let run = self.run.clone();
        let job_id = self.tasks[&node_id]
            .job_id
            .clone()
            .expect("completed task has a job id");

        let mut errors: Vec<String> = Vec::new();
        let final_state = match observed {
            BackendTaskState::Success => {
                let result = self
                    .engine
                    .retry
                    .run("get_task_result", ComputeBackendError::is_transient, || {
                        self.engine.backend.get_task_result(&job_id)
                    })
                    .await;
                match result {
                    Ok(output) => {
                        debug!(
                            run = %run.key(),
                            node_id = %node_id,
                            ports = output.ports.len(),
                            "task completed successfully"
                        );
                        TaskState::Success
                    }
                    Err(err) => {
                        // a "successful" task without retrievable outputs is
                        // a failure: scrub whatever was partially written
                        warn!(run = %run.key(), node_id = %node_id, error = %err, "result fetch failed");
                        errors.push(err.to_string());
                        self.clean_artifacts(node_id).await;
                        TaskState::Failed
                    }
                }
            }
            BackendTaskState::Erred => {
                // fetch the result anyway: the error travels through it
                let result = self.engine.backend.get_task_result(&job_id).await;
                match result {
                    Err(ComputeBackendError::TaskFailed(msg)) => errors.push(msg),
                    Err(err) => errors.push(err.to_string()),
                    Ok(_) => errors.push("task reported as erred by the backend".to_string()),
                }
                self.clean_artifacts(node_id).await;
                TaskState::Failed
            }
            BackendTaskState::Aborted => {
                self.clean_artifacts(node_id).await;
                TaskState::Aborted
            }
            BackendTaskState::Lost => {
                warn!(run = %run.key(), node_id = %node_id, job_id = %job_id, "job was lost by the backend");
                metrics::counter!("gantry_lost_jobs_total").increment(1);
                errors.push("job was lost by the backend".to_string());
                self.clean_artifacts(node_id).await;
                TaskState::Failed
            }
            BackendTaskState::Pending | BackendTaskState::PendingOrStarted => {
                unreachable!("only terminal backend states reach completion processing")
            }
        };

        let platform_ok = observed != BackendTaskState::Lost;
        {
            let task = self.tasks.get_mut(&node_id).expect("task present");
            task.state = final_state;
            task.progress = Some(1.0);
            task.ended_at = Some(Utc::now());
            task.errors.extend(errors);
            self.changed.insert(node_id);
        }
        let snapshot = self.tasks[&node_id].clone();
        self.engine
            .emit_task_stopped(&run, &snapshot, final_state, platform_ok)
            .await;

        if let Err(err) = self.engine.backend.release_task_result(&job_id).await {
            debug!(job_id = %job_id, error = %err, "failed to release task result");
        }
    }

    /// Remove partially written outputs/logs so downstream nodes never read
    /// stale data.
    async fn clean_artifacts(&self, node_id: NodeId) {
        if let Err(err) = self
            .engine
            .backend
            .clean_output_artifacts(self.run.project_id, node_id)
            .await
        {
            warn!(
                project_id = %self.run.project_id,
                node_id = %node_id,
                error = %err,
                "failed to clean task output artifacts"
            );
        }
    }

    /// Everything downstream of a failed task can never run.
    fn abort_tasks_downstream_of_failed(&mut self) {
        let failed: Vec<NodeId> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Failed)
            .map(|t| t.node_id)
            .collect();
        let now = Utc::now();
        for failed_node in failed {
            for downstream in self.dag.descendants(&failed_node) {
                if let Some(task) = self.tasks.get_mut(&downstream)
                    && !task.state.is_terminal()
                {
                    task.state = TaskState::Aborted;
                    task.progress = Some(1.0);
                    task.ended_at = Some(now);
                    self.changed.insert(downstream);
                }
            }
        }
    }

    /// Cancellation: abort unsubmitted tasks directly, ask the backend to
    /// abort in-flight ones. Their terminal state is observed next pass.
    async fn schedule_tasks_to_stop(&mut self) {
        let now = Utc::now();
        let unsubmitted: Vec<NodeId> = self
            .tasks
            .values()
            .filter(|t| t.job_id.is_none() && t.state.is_unsettled())
            .map(|t| t.node_id)
            .collect();
        for node_id in unsubmitted {
            let task = self.tasks.get_mut(&node_id).expect("task present");
            task.state = TaskState::Aborted;
            task.progress = Some(1.0);
            task.ended_at = Some(now);
            self.changed.insert(node_id);
        }

        let in_flight: Vec<JobId> = self
            .tasks
            .values()
            .filter(|t| t.state.is_in_flight())
            .filter_map(|t| t.job_id.clone())
            .collect();
        let aborts = in_flight
            .iter()
            .map(|job_id| self.engine.backend.abort_computation_task(job_id));
        for (job_id, result) in in_flight.iter().zip(join_all(aborts).await) {
            if let Err(err) = result {
                warn!(job_id = %job_id, error = %err, "failed to abort task, will retry next pass");
            }
        }
    }

    /// Submit every published task whose predecessors all succeeded.
    async fn schedule_tasks_to_start(&mut self) -> SchedulerResult<()> {
        let ready: Vec<NodeId> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Published)
            .filter(|t| {
                self.dag
                    .predecessors(&t.node_id)
                    .iter()
                    .all(|p| self.tasks.get(p).is_some_and(|pt| pt.state == TaskState::Success))
            })
            .map(|t| t.node_id)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let acquire_result = self
            .engine
            .retry
            .run(
                "get_or_create_cluster",
                ComputeBackendError::is_transient,
                || {
                    self.engine.backend.get_or_create_cluster(
                        self.run.user_id,
                        self.run.cluster_id,
                        self.run.use_on_demand_cluster,
                    )
                },
            )
            .await;
        let cluster = match acquire_result {
            Ok(cluster) => cluster,
            Err(ComputeBackendError::NotConnected) => {
                warn!(run = %self.run.key(), "backend not connected, submission deferred");
                return Ok(());
            }
            Err(ComputeBackendError::OnDemandClusterNotReady(reason)) => {
                info!(run = %self.run.key(), reason = %reason, "on-demand cluster not ready yet");
                self.engine
                    .publish(SchedulerEvent::PipelineLog {
                        user_id: self.run.user_id,
                        project_id: self.run.project_id,
                        level: LogLevel::Info,
                        message: format!("waiting for cluster: {reason}"),
                    })
                    .await;
                self.enter_cluster_wait();
                return Ok(());
            }
            Err(ComputeBackendError::ClustersKeeperUnavailable) => {
                error!(run = %self.run.key(), "clusters keeper unavailable, failing tasks");
                self.fail_tasks(
                    &ready,
                    "no computational cluster can be provisioned".to_string(),
                )
                .await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.run.cluster_wait_since = None;

        let submissions: Vec<TaskSubmission> = ready
            .iter()
            .map(|node_id| TaskSubmission {
                node_id: *node_id,
                image: self.tasks[node_id].image.clone(),
            })
            .collect();
        let submit_result = self
            .engine
            .backend
            .send_computation_tasks(
                self.run.user_id,
                self.run.project_id,
                cluster,
                &submissions,
                self.wake_up.clone(),
                &self.run.metadata,
            )
            .await;
        let submitted = match submit_result {
            Ok(submitted) => submitted,
            Err(ComputeBackendError::NotConnected) => {
                warn!(run = %self.run.key(), "backend dropped during submission, retrying next pass");
                return Ok(());
            }
            Err(ComputeBackendError::OnDemandClusterNotReady(reason)) => {
                info!(run = %self.run.key(), reason = %reason, "cluster went away during submission");
                self.enter_cluster_wait();
                return Ok(());
            }
            Err(err) => {
                error!(run = %self.run.key(), error = %err, "task submission failed");
                self.fail_tasks(&ready, err.to_string()).await;
                return Ok(());
            }
        };

        metrics::counter!("gantry_submissions_total").increment(submitted.len() as u64);
        for entry in submitted {
            let task = self.tasks.get_mut(&entry.node_id).expect("task present");
            // the job id is set exactly once and never overwritten
            if task.job_id.is_none() {
                task.job_id = Some(entry.job_id);
            }
            task.state = TaskState::Pending;
            self.changed.insert(entry.node_id);
            self.submitted += 1;
        }
        Ok(())
    }

    fn enter_cluster_wait(&mut self) {
        if self.run.cluster_wait_since.is_none() {
            self.run.cluster_wait_since = Some(Utc::now());
        }
    }

    /// A run cannot wait for a cluster forever.
    async fn fail_if_waiting_for_cluster_too_long(&mut self) {
        let Some(since) = self.run.cluster_wait_since else {
            return;
        };
        if Utc::now() - since <= self.engine.cluster_wait_timeout {
            return;
        }
        error!(run = %self.run.key(), "timed out waiting for computational cluster");
        let stuck: Vec<NodeId> = self
            .tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.node_id)
            .collect();
        self.fail_tasks(&stuck, "timed out waiting for computational cluster".to_string())
            .await;
        self.run.cluster_wait_since = None;
    }

    async fn fail_tasks(&mut self, nodes: &[NodeId], reason: String) {
        let now = Utc::now();
        for node_id in nodes {
            let task = self.tasks.get_mut(node_id).expect("task present");
            task.state = TaskState::Failed;
            task.progress = Some(1.0);
            task.ended_at = Some(now);
            task.errors.push(reason.clone());
            self.changed.insert(*node_id);
        }
        self.engine
            .publish(SchedulerEvent::PipelineLog {
                user_id: self.run.user_id,
                project_id: self.run.project_id,
                level: LogLevel::Error,
                message: reason,
            })
            .await;
    }

    /// At most one heartbeat per task per interval, keyed off the persisted
    /// timestamp so restarts do not double-send.
    async fn send_heartbeats(&mut self) {
        let now = Utc::now();
        let interval = self.engine.heartbeat_interval;
        let due: Vec<NodeId> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Started)
            .filter(|t| match (t.last_heartbeat, t.started_at) {
                (Some(beat), _) => now - beat > interval,
                (None, Some(started)) => now - started > interval,
                (None, None) => false,
            })
            .map(|t| t.node_id)
            .collect();
        let beats = due.iter().map(|node_id| {
            self.engine
                .publish(SchedulerEvent::ResourceTrackingHeartbeat {
                    service_run_id: resource_tracking_run_id(
                        self.run.user_id,
                        self.run.project_id,
                        *node_id,
                        self.run.iteration,
                    ),
                    emitted_at: now,
                })
        });
        join_all(beats).await;
        for node_id in due {
            let task = self.tasks.get_mut(&node_id).expect("task present");
            task.last_heartbeat = Some(now);
            self.changed.insert(node_id);
        }
    }

    /// Recompute the aggregate run state, commit the pass and report.
    async fn finalize(mut self) -> SchedulerResult<PassOutcome> {
        let states: Vec<TaskState> = self.tasks.values().map(|t| t.state).collect();
        let mut new_state =
            advance_run_state(self.run.state, &states, self.run.cancellation_requested);
        // tasks kept Published while the cluster provisions: the run reflects
        // the wait even though nothing was handed to the backend yet
        if self.run.cluster_wait_since.is_some() && !new_state.is_terminal() {
            new_state = RunState::WaitingForCluster;
        }

        let now = Utc::now();
        if new_state != self.run.state {
            info!(
                run = %self.run.key(),
                from = %self.run.state,
                to = %new_state,
                "run state changed"
            );
            if new_state == RunState::Started && self.run.started_at.is_none() {
                self.run.started_at = Some(now);
            }
            if new_state.is_terminal() {
                self.run.ended_at = Some(now);
            }
            self.run.state = new_state;
        }

        let changed_tasks: Vec<PipelineTask> = self
            .changed
            .iter()
            .map(|node_id| self.tasks[node_id].clone())
            .collect();
        self.engine
            .store
            .apply_pass_update(PassUpdate {
                run: self.run.clone(),
                tasks: changed_tasks,
            })
            .await?;

        let in_flight = self
            .tasks
            .values()
            .filter(|t| t.state.is_in_flight())
            .count();
        self.engine
            .publish(SchedulerEvent::SchedulingStatus {
                user_id: self.run.user_id,
                project_id: self.run.project_id,
                iteration: self.run.iteration,
                run_state: new_state,
                submitted: self.submitted,
                in_flight,
            })
            .await;

        if new_state.is_terminal() {
            info!(run = %self.run.key(), result = %new_state, "pipeline run completed");
            Ok(PassOutcome::Settled(new_state))
        } else {
            Ok(PassOutcome::InProgress(new_state))
        }
    }

    fn update_task_state(&mut self, node_id: NodeId, state: TaskState) {
        let task = self.tasks.get_mut(&node_id).expect("task present");
        if task.state != state {
            task.state = state;
            self.changed.insert(node_id);
        }
    }
}
