//! Top-level scheduler manager.
//!
//! Accepts scheduling requests for (user, project, iteration) keys, guarantees
//! at most one concurrent pass per key, dispatches passes onto a bounded
//! worker pool and re-enqueues non-terminal runs. Requests arriving while a
//! pass is in flight coalesce into a single follow-up pass. A periodic sweep
//! over the store's active runs acts as the safety net for missed wake-ups.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use crate::backend::{ComputeBackend, SchedulerCallback};
use crate::config::Config;
use crate::engine::SchedulingEngine;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::events::EventPublisher;
use crate::models::{ClusterId, JobId, ProjectId, RunKey, RunMetadata, UserId};
use crate::store::{PipelineStore, StoreError};

#[derive(Debug, Default, Clone, Copy)]
struct PassSlot {
    running: bool,
    rerun: bool,
}

/// Single-flight request queue with per-key coalescing.
struct PassQueue {
    slots: Mutex<HashMap<RunKey, PassSlot>>,
    tx: mpsc::UnboundedSender<RunKey>,
}

impl PassQueue {
    fn new(tx: mpsc::UnboundedSender<RunKey>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Request a pass for a key. Requests for a key that is queued or in
    /// flight collapse into at most one follow-up pass.
    fn request(&self, key: RunKey) {
        let mut slots = self.slots.lock().expect("pass queue poisoned");
        match slots.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(PassSlot::default());
                let _ = self.tx.send(key);
            }
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.running {
                    slot.rerun = true;
                }
                // not running: the key is already queued, nothing to add
            }
        }
    }

    fn begin(&self, key: &RunKey) {
        if let Some(slot) = self.slots.lock().expect("pass queue poisoned").get_mut(key) {
            slot.running = true;
        }
    }

    /// Finish a pass; returns true when a follow-up pass was enqueued.
    fn complete(&self, key: RunKey, reschedule: bool) -> bool {
        let mut slots = self.slots.lock().expect("pass queue poisoned");
        let Some(slot) = slots.get_mut(&key) else {
            return false;
        };
        if reschedule || slot.rerun {
            *slot = PassSlot::default();
            let _ = self.tx.send(key);
            true
        } else {
            slots.remove(&key);
            false
        }
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.slots.lock().expect("pass queue poisoned").len()
    }
}

/// Public scheduling API plus the background dispatch machinery.
pub struct SchedulerManager {
    engine: Arc<SchedulingEngine>,
    store: Arc<dyn PipelineStore>,
    queue: Arc<PassQueue>,
    default_cluster_id: ClusterId,
}

impl SchedulerManager {
    /// Create a run for the project's pipeline and request the first pass.
    ///
    /// Passing `cluster_id = None` uses the configured default cluster.
    pub async fn run_new_pipeline(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        cluster_id: Option<ClusterId>,
        metadata: RunMetadata,
        use_on_demand_cluster: bool,
    ) -> SchedulerResult<RunKey> {
        let Some(dag) = self.store.get_dag(project_id).await? else {
            return Err(SchedulerError::InvalidPipeline {
                project_id,
                reason: "project has no pipeline defined".to_string(),
            });
        };
        if dag.is_empty() {
            return Err(SchedulerError::InvalidPipeline {
                project_id,
                reason: "pipeline has no nodes".to_string(),
            });
        }
        let tasks = self.store.list_tasks(project_id).await?;
        if !tasks
            .iter()
            .any(|t| t.is_computational() && dag.contains(&t.node_id))
        {
            return Err(SchedulerError::InvalidPipeline {
                project_id,
                reason: "pipeline has no computational tasks".to_string(),
            });
        }

        let run = match self
            .store
            .create_run(
                user_id,
                project_id,
                cluster_id.unwrap_or(self.default_cluster_id),
                use_on_demand_cluster,
                metadata,
            )
            .await
        {
            Ok(run) => run,
            Err(StoreError::ActiveRunExists(_)) => {
                return Err(SchedulerError::PipelineAlreadyRunning { project_id });
            }
            Err(err) => return Err(err.into()),
        };
        self.store.mark_tasks_published(project_id).await?;

        info!(
            run = %run.key(),
            cluster_id = run.cluster_id,
            on_demand = run.use_on_demand_cluster,
            "new pipeline run created"
        );
        self.request_pass(run.key());
        Ok(run.key())
    }

    /// Request cancellation of the project's active run and trigger an
    /// immediate pass to propagate it.
    pub async fn stop_pipeline(
        &self,
        user_id: UserId,
        project_id: ProjectId,
    ) -> SchedulerResult<RunKey> {
        let run = self
            .store
            .find_active_run(project_id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or(SchedulerError::PipelineNotFound { project_id })?;
        self.store.set_cancellation_requested(&run.key()).await?;
        info!(run = %run.key(), "pipeline cancellation requested");
        self.request_pass(run.key());
        Ok(run.key())
    }

    /// Manual/forced pass trigger; also the wake-up target for backend
    /// completion callbacks and the sweep.
    pub fn request_pass(&self, key: RunKey) {
        self.queue.request(key);
    }

    /// Inbound progress delivery from the bus subscription.
    pub async fn on_progress_event(&self, job_id: &JobId, progress: f32) -> SchedulerResult<()> {
        self.engine.on_progress_event(job_id, progress).await
    }
}

/// Handles to the manager's background tasks.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the background loops to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.dispatch.await;
        let _ = self.sweep.await;
    }
}

/// Construct the manager and start its dispatch and sweep loops.
pub fn spawn_scheduler_manager(
    store: Arc<dyn PipelineStore>,
    backend: Arc<dyn ComputeBackend>,
    publisher: Arc<dyn EventPublisher>,
    config: &Config,
) -> (Arc<SchedulerManager>, SchedulerHandle) {
    let engine = Arc::new(SchedulingEngine::new(
        store.clone(),
        backend,
        publisher,
        config,
    ));
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = Arc::new(PassQueue::new(tx));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = Arc::new(SchedulerManager {
        engine: engine.clone(),
        store: store.clone(),
        queue: queue.clone(),
        default_cluster_id: config.default_cluster_id,
    });

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_passes.max(1)));
    let dispatch = tokio::spawn(dispatch_loop(
        engine,
        queue.clone(),
        rx,
        semaphore,
        shutdown_rx.clone(),
    ));
    let sweep = tokio::spawn(sweep_loop(
        store,
        queue,
        config.sweep_interval_ms,
        shutdown_rx,
    ));

    info!(
        max_concurrent_passes = config.max_concurrent_passes,
        sweep_interval_ms = config.sweep_interval_ms,
        "scheduler manager started"
    );
    (manager, SchedulerHandle { shutdown_tx, dispatch, sweep })
}

/// Consume the de-duplicated queue and run passes on the worker pool.
async fn dispatch_loop(
    engine: Arc<SchedulingEngine>,
    queue: Arc<PassQueue>,
    mut rx: mpsc::UnboundedReceiver<RunKey>,
    semaphore: Arc<Semaphore>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_key = rx.recv() => {
                let Some(key) = maybe_key else { break };
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                queue.begin(&key);
                let engine = Arc::clone(&engine);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let wake_up: SchedulerCallback = {
                        let queue = Arc::clone(&queue);
                        Arc::new(move || queue.request(key))
                    };
                    match engine.apply(key, wake_up).await {
                        Ok(outcome) => {
                            debug!(run = %key, ?outcome, "scheduling pass finished");
                        }
                        Err(err) => {
                            metrics::counter!("gantry_pass_errors_total").increment(1);
                            error!(run = %key, error = %err, "scheduling pass failed");
                        }
                    }
                    // follow-up passes are edge-triggered (completion
                    // callbacks, stop/run requests) with the sweep as the
                    // safety net; only coalesced requests re-enqueue here
                    if queue.complete(key, false) {
                        debug!(run = %key, "coalesced follow-up pass enqueued");
                    }
                    drop(permit);
                });
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    info!("dispatch loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Periodic safety net: re-enqueue every non-terminal run.
async fn sweep_loop(
    store: Arc<dyn PipelineStore>,
    queue: Arc<PassQueue>,
    interval_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.list_active_runs().await {
                    Ok(runs) => {
                        for run in runs {
                            queue.request(run.key());
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "sweep failed to list active runs");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    info!("sweep loop shutting down");
                    break;
                }
            }
        }
    }
}
