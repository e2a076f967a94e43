//! End-to-end scheduling scenarios against the in-memory store and the fake
//! compute backend: submission ordering, cancellation, cluster waits, failure
//! handling, idempotence and crash-resume.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use gantry::{
    BackendTaskState, Config, MemoryStore, PassOutcome, PipelineStore, RecordingPublisher,
    RunMetadata, RunState, SchedulerError, SchedulerEvent, SchedulingEngine, TaskState,
    noop_wake_up, spawn_scheduler_manager,
};
use harness::{
    ClusterOutcome, FakeBackend, TEST_USER, author_pipeline, start_run, start_run_with_cluster,
};

fn engine(
    store: &MemoryStore,
    backend: &FakeBackend,
    publisher: &RecordingPublisher,
) -> SchedulingEngine {
    let _ = tracing_subscriber::fmt::try_init();
    SchedulingEngine::new(
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(publisher.clone()),
        &Config::test_config(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn count_events(publisher: &RecordingPublisher, pred: impl Fn(&SchedulerEvent) -> bool) -> usize {
    publisher.events().iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn independent_tasks_run_to_success() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 4, &[]).await;
    let key = start_run(&store, project).await;

    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::InProgress(RunState::Pending));
    assert_eq!(backend.submissions().len(), 4);
    for node in &nodes {
        assert_eq!(store.task(project, *node).unwrap().state, TaskState::Pending);
    }

    backend.set_all_statuses(BackendTaskState::Success);
    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Success));
    for node in &nodes {
        let task = store.task(project, *node).unwrap();
        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.progress, Some(1.0));
    }
    assert_eq!(store.runs()[0].state, RunState::Success);
    assert!(store.runs()[0].ended_at.is_some());
    Ok(())
}

#[tokio::test]
async fn dependent_task_waits_for_predecessor() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 2, &[(0, 1)]).await;
    let key = start_run(&store, project).await;

    engine.apply(key, noop_wake_up()).await?;
    assert_eq!(backend.submission_count(&nodes[0]), 1);
    assert_eq!(backend.submission_count(&nodes[1]), 0);

    let job_a = backend.job_for(&nodes[0]).unwrap();
    backend.set_status(&job_a, BackendTaskState::Success);
    engine.apply(key, noop_wake_up()).await?;
    assert_eq!(store.task(project, nodes[0]).unwrap().state, TaskState::Success);
    assert_eq!(backend.submission_count(&nodes[1]), 1);

    let job_b = backend.job_for(&nodes[1]).unwrap();
    backend.set_status(&job_b, BackendTaskState::Success);
    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Success));
    Ok(())
}

#[tokio::test]
async fn cancellation_aborts_started_tasks() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 2, &[]).await;
    let key = start_run(&store, project).await;

    engine.apply(key, noop_wake_up()).await?;
    let job = backend.job_for(&nodes[0]).unwrap();
    engine.on_progress_event(&job, 0.3).await?;
    assert_eq!(store.task(project, nodes[0]).unwrap().state, TaskState::Started);

    store.set_cancellation_requested(&key).await?;
    engine.apply(key, noop_wake_up()).await?;
    let mut aborted = backend.aborted_jobs();
    aborted.sort();
    let mut expected: Vec<_> = nodes.iter().map(|n| backend.job_for(n).unwrap()).collect();
    expected.sort();
    assert_eq!(aborted, expected);

    // backend confirmed the aborts; the next pass observes them
    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Aborted));
    for node in &nodes {
        assert_eq!(store.task(project, *node).unwrap().state, TaskState::Aborted);
    }
    assert_eq!(store.runs()[0].state, RunState::Aborted);
    Ok(())
}

#[tokio::test]
async fn on_demand_cluster_wait_keeps_tasks_published() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 2, &[]).await;
    backend.push_cluster_outcome(ClusterOutcome::NotReady("provisioning".to_string()));
    let key = start_run_with_cluster(&store, project, true).await;

    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::InProgress(RunState::WaitingForCluster));
    assert!(backend.submissions().is_empty());
    for node in &nodes {
        assert_eq!(store.task(project, *node).unwrap().state, TaskState::Published);
    }
    assert_eq!(
        count_events(&publisher, |e| matches!(e, SchedulerEvent::PipelineLog { .. })),
        1
    );

    // cluster came up: the retry acquires it and submits without re-reading
    // completed work
    engine.apply(key, noop_wake_up()).await?;
    assert_eq!(backend.submissions().len(), 2);
    for node in &nodes {
        assert_eq!(store.task(project, *node).unwrap().state, TaskState::Pending);
    }

    backend.set_all_statuses(BackendTaskState::Success);
    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Success));
    Ok(())
}

#[tokio::test]
async fn erred_task_fails_run_and_cleans_outputs() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 2, &[]).await;
    let key = start_run(&store, project).await;

    engine.apply(key, noop_wake_up()).await?;
    let bad_job = backend.job_for(&nodes[0]).unwrap();
    let good_job = backend.job_for(&nodes[1]).unwrap();
    backend.set_status(&bad_job, BackendTaskState::Erred);
    backend.set_error_message(&bad_job, "solver blew up");
    backend.set_status(&good_job, BackendTaskState::Success);

    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Failed));

    let failed = store.task(project, nodes[0]).unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.progress, Some(1.0));
    assert!(failed.errors.iter().any(|e| e.contains("solver blew up")));
    assert_eq!(backend.cleaned_artifacts(), vec![(project, nodes[0])]);

    let succeeded = store.task(project, nodes[1]).unwrap();
    assert_eq!(succeeded.state, TaskState::Success);

    assert_eq!(store.runs()[0].state, RunState::Failed);
    assert_eq!(
        count_events(&publisher, |e| matches!(e, SchedulerEvent::ServiceStopped { .. })),
        2
    );
    assert_eq!(backend.released_jobs().len(), 2);
    Ok(())
}

#[tokio::test]
async fn apply_is_idempotent_without_external_change() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 3, &[]).await;
    let key = start_run(&store, project).await;

    engine.apply(key, noop_wake_up()).await?;
    let states_after_first: Vec<TaskState> = nodes
        .iter()
        .map(|n| store.task(project, *n).unwrap().state)
        .collect();

    engine.apply(key, noop_wake_up()).await?;
    let states_after_second: Vec<TaskState> = nodes
        .iter()
        .map(|n| store.task(project, *n).unwrap().state)
        .collect();
    assert_eq!(states_after_first, states_after_second);
    for node in &nodes {
        assert_eq!(backend.submission_count(node), 1);
    }
    assert_eq!(
        count_events(&publisher, |e| matches!(e, SchedulerEvent::ServiceStarted { .. })),
        0
    );

    backend.set_all_statuses(BackendTaskState::Success);
    engine.apply(key, noop_wake_up()).await?;
    let stopped_after_settling =
        count_events(&publisher, |e| matches!(e, SchedulerEvent::ServiceStopped { .. }));
    assert_eq!(stopped_after_settling, 3);

    // a pass on a settled run is a no-op and duplicates nothing
    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Skipped);
    assert_eq!(
        count_events(&publisher, |e| matches!(e, SchedulerEvent::ServiceStopped { .. })),
        stopped_after_settling
    );
    Ok(())
}

#[tokio::test]
async fn progress_is_clamped_monotonic_and_starts_once() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 1, &[]).await;
    let key = start_run(&store, project).await;
    engine.apply(key, noop_wake_up()).await?;
    let job = backend.job_for(&nodes[0]).unwrap();

    engine.on_progress_event(&job, -0.5).await?;
    let task = store.task(project, nodes[0]).unwrap();
    assert_eq!(task.state, TaskState::Started);
    assert_eq!(task.progress, Some(0.0));
    assert!(task.started_emitted);

    engine.on_progress_event(&job, 1.8).await?;
    assert_eq!(store.task(project, nodes[0]).unwrap().progress, Some(1.0));

    // late out-of-order value does not regress the stored progress
    engine.on_progress_event(&job, 0.4).await?;
    assert_eq!(store.task(project, nodes[0]).unwrap().progress, Some(1.0));

    assert_eq!(
        count_events(&publisher, |e| matches!(e, SchedulerEvent::ServiceStarted { .. })),
        1
    );
    assert_eq!(
        count_events(&publisher, |e| matches!(
            e,
            SchedulerEvent::ResourceTrackingStarted { .. }
        )),
        1
    );
    assert_eq!(
        count_events(&publisher, |e| matches!(e, SchedulerEvent::TaskProgress { .. })),
        3
    );
    Ok(())
}

#[tokio::test]
async fn crash_resume_matches_uninterrupted_execution() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let (project, nodes) = author_pipeline(&store, 2, &[(0, 1)]).await;
    let key = start_run(&store, project).await;

    {
        let first_engine = engine(&store, &backend, &publisher);
        first_engine.apply(key, noop_wake_up()).await?;
    }
    // "crash": a brand-new engine resumes purely from stored rows
    let resumed = engine(&store, &backend, &publisher);
    let job_a = backend.job_for(&nodes[0]).unwrap();
    backend.set_status(&job_a, BackendTaskState::Success);
    resumed.apply(key, noop_wake_up()).await?;

    let job_b = backend.job_for(&nodes[1]).unwrap();
    backend.set_status(&job_b, BackendTaskState::Success);
    let outcome = resumed.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Success));
    for node in &nodes {
        assert_eq!(backend.submission_count(node), 1);
        assert_eq!(store.task(project, *node).unwrap().state, TaskState::Success);
    }
    Ok(())
}

#[tokio::test]
async fn tasks_downstream_of_failure_are_aborted() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 3, &[(0, 1), (1, 2)]).await;
    let key = start_run(&store, project).await;

    engine.apply(key, noop_wake_up()).await?;
    let job = backend.job_for(&nodes[0]).unwrap();
    backend.set_status(&job, BackendTaskState::Erred);
    let outcome = engine.apply(key, noop_wake_up()).await?;

    assert_eq!(store.task(project, nodes[0]).unwrap().state, TaskState::Failed);
    assert_eq!(store.task(project, nodes[1]).unwrap().state, TaskState::Aborted);
    assert_eq!(store.task(project, nodes[2]).unwrap().state, TaskState::Aborted);
    assert_eq!(outcome, PassOutcome::Settled(RunState::Failed));
    // the never-submitted downstream tasks stay unsubmitted
    assert_eq!(backend.submission_count(&nodes[1]), 0);
    assert_eq!(backend.submission_count(&nodes[2]), 0);
    Ok(())
}

#[tokio::test]
async fn lost_job_is_resolved_as_failed() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 1, &[]).await;
    let key = start_run(&store, project).await;

    engine.apply(key, noop_wake_up()).await?;
    let job = backend.job_for(&nodes[0]).unwrap();
    backend.set_status(&job, BackendTaskState::Lost);

    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Failed));
    let task = store.task(project, nodes[0]).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.errors.iter().any(|e| e.contains("lost")));
    assert_eq!(backend.cleaned_artifacts().len(), 1);
    Ok(())
}

#[tokio::test]
async fn heartbeats_are_rate_limited_per_interval() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 1, &[]).await;
    let key = start_run(&store, project).await;
    engine.apply(key, noop_wake_up()).await?;
    let job = backend.job_for(&nodes[0]).unwrap();
    engine.on_progress_event(&job, 0.1).await?;

    // push the start into the past so the first heartbeat is due
    let mut task = store.task(project, nodes[0]).unwrap();
    task.started_at = Some(Utc::now() - chrono::Duration::minutes(2));
    store.upsert_task(task).await?;

    engine.apply(key, noop_wake_up()).await?;
    assert_eq!(
        count_events(&publisher, |e| matches!(
            e,
            SchedulerEvent::ResourceTrackingHeartbeat { .. }
        )),
        1
    );

    // the interval has not elapsed since the persisted heartbeat
    engine.apply(key, noop_wake_up()).await?;
    assert_eq!(
        count_events(&publisher, |e| matches!(
            e,
            SchedulerEvent::ResourceTrackingHeartbeat { .. }
        )),
        1
    );
    assert!(store.task(project, nodes[0]).unwrap().last_heartbeat.is_some());
    Ok(())
}

#[tokio::test]
async fn unavailable_clusters_keeper_fails_run_without_retry() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 2, &[]).await;
    backend.push_cluster_outcome(ClusterOutcome::KeeperDown);
    let key = start_run_with_cluster(&store, project, true).await;

    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Failed));
    for node in &nodes {
        let task = store.task(project, *node).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.progress, Some(1.0));
        assert!(!task.errors.is_empty());
    }
    assert!(backend.submissions().is_empty());
    Ok(())
}

#[tokio::test]
async fn disconnected_backend_defers_without_failing() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 1, &[]).await;
    let key = start_run(&store, project).await;

    backend.set_disconnected(true);
    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::InProgress(RunState::Published));
    assert_eq!(store.task(project, nodes[0]).unwrap().state, TaskState::Published);

    backend.set_disconnected(false);
    engine.apply(key, noop_wake_up()).await?;
    assert_eq!(store.task(project, nodes[0]).unwrap().state, TaskState::Pending);
    Ok(())
}

#[tokio::test]
async fn cluster_wait_times_out_into_failure() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    let (project, nodes) = author_pipeline(&store, 1, &[]).await;
    backend.push_cluster_outcome(ClusterOutcome::NotReady("provisioning".to_string()));
    backend.push_cluster_outcome(ClusterOutcome::NotReady("still provisioning".to_string()));
    let key = start_run_with_cluster(&store, project, true).await;

    engine.apply(key, noop_wake_up()).await?;
    assert_eq!(store.runs()[0].state, RunState::WaitingForCluster);

    // age the wait past the timeout
    let mut run = store.runs()[0].clone();
    run.cluster_wait_since = Some(Utc::now() - chrono::Duration::minutes(20));
    store
        .apply_pass_update(gantry::PassUpdate { run, tasks: vec![] })
        .await?;

    let outcome = engine.apply(key, noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Failed));
    let task = store.task(project, nodes[0]).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.errors.iter().any(|e| e.contains("imed out")));
    Ok(())
}

#[tokio::test]
async fn run_without_pipeline_definition_is_aborted() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let engine = engine(&store, &backend, &publisher);
    // run row exists but the project never defined a pipeline
    let run = store
        .create_run(TEST_USER, uuid::Uuid::new_v4(), 0, false, RunMetadata::new())
        .await?;

    let outcome = engine.apply(run.key(), noop_wake_up()).await?;
    assert_eq!(outcome, PassOutcome::Settled(RunState::Aborted));
    assert_eq!(store.runs()[0].state, RunState::Aborted);
    Ok(())
}

#[tokio::test]
async fn manager_drives_pipeline_to_success() -> Result<()> {
    let (store, backend, publisher) = (
        MemoryStore::new(),
        FakeBackend::with_auto_success(),
        RecordingPublisher::new(),
    );
    let (project, nodes) = author_pipeline(&store, 3, &[(0, 1), (1, 2)]).await;
    let (manager, handle) = spawn_scheduler_manager(
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(publisher.clone()),
        &Config::test_config(),
    );

    manager
        .run_new_pipeline(TEST_USER, project, None, RunMetadata::new(), false)
        .await?;
    let settled = wait_until(
        || store.runs().first().is_some_and(|r| r.state == RunState::Success),
        Duration::from_secs(5),
    )
    .await;
    assert!(settled, "run never settled: {:?}", store.runs());
    for node in &nodes {
        assert_eq!(backend.submission_count(node), 1);
    }
    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn manager_rejects_concurrent_runs_and_stops_pipelines() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let (project, _nodes) = author_pipeline(&store, 1, &[]).await;
    let (manager, handle) = spawn_scheduler_manager(
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(publisher.clone()),
        &Config::test_config(),
    );

    manager
        .run_new_pipeline(TEST_USER, project, None, RunMetadata::new(), false)
        .await?;
    let err = manager
        .run_new_pipeline(TEST_USER, project, None, RunMetadata::new(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::PipelineAlreadyRunning { .. }));

    manager.stop_pipeline(TEST_USER, project).await?;
    let aborted = wait_until(
        || store.runs().first().is_some_and(|r| r.state == RunState::Aborted),
        Duration::from_secs(5),
    )
    .await;
    assert!(aborted, "run never aborted: {:?}", store.runs());

    let err = manager.stop_pipeline(TEST_USER, project).await.unwrap_err();
    assert!(matches!(err, SchedulerError::PipelineNotFound { .. }));
    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn manager_validates_pipelines_before_running() -> Result<()> {
    let (store, backend, publisher) = (MemoryStore::new(), FakeBackend::new(), RecordingPublisher::new());
    let (manager, handle) = spawn_scheduler_manager(
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        Arc::new(publisher.clone()),
        &Config::test_config(),
    );

    let unknown_project = uuid::Uuid::new_v4();
    let err = manager
        .run_new_pipeline(TEST_USER, unknown_project, None, RunMetadata::new(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidPipeline { .. }));

    let err = manager
        .stop_pipeline(TEST_USER, unknown_project)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::PipelineNotFound { .. }));
    handle.shutdown().await;
    Ok(())
}
