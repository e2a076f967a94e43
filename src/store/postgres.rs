//! Postgres store for run and task rows.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use super::{PassUpdate, PipelineStore, StoreError, StoreResult};
use crate::dag::PipelineDag;
use crate::models::{
    ClusterId, JobId, PipelineRun, PipelineTask, ProjectId, RunKey, RunMetadata, TaskImage, UserId,
};
use crate::run_state::{RunState, TaskState};

const TERMINAL_RUN_STATES: &[&str] = &["SUCCESS", "FAILED", "ABORTED"];

/// Persist runs and tasks in Postgres.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|err| StoreError::Message(err.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn run_from_row(row: &PgRow) -> StoreResult<PipelineRun> {
        let state: String = row.try_get("state")?;
        let metadata: Json<RunMetadata> = row.try_get("metadata")?;
        Ok(PipelineRun {
            user_id: row.try_get("user_id")?,
            project_id: row.try_get("project_id")?,
            iteration: row.try_get("iteration")?,
            cluster_id: row.try_get("cluster_id")?,
            use_on_demand_cluster: row.try_get("use_on_demand_cluster")?,
            state: state.parse::<RunState>().map_err(StoreError::Message)?,
            metadata: metadata.0,
            cancellation_requested: row.try_get("cancellation_requested")?,
            cluster_wait_since: row.try_get("cluster_wait_since")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn task_from_row(row: &PgRow) -> StoreResult<PipelineTask> {
        let state: String = row.try_get("state")?;
        let node_class: String = row.try_get("node_class")?;
        let image: Json<TaskImage> = row.try_get("image")?;
        let errors: Json<Vec<String>> = row.try_get("errors")?;
        Ok(PipelineTask {
            project_id: row.try_get("project_id")?,
            node_id: row.try_get("node_id")?,
            job_id: row.try_get("job_id")?,
            image: image.0,
            state: state.parse::<TaskState>().map_err(StoreError::Message)?,
            progress: row.try_get("progress")?,
            node_class: node_class.parse().map_err(StoreError::Message)?,
            started_emitted: row.try_get("started_emitted")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            errors: errors.0,
        })
    }
}

#[async_trait]
impl PipelineStore for PostgresStore {
    async fn get_run(&self, key: &RunKey) -> StoreResult<Option<PipelineRun>> {
        let row = sqlx::query(
            "SELECT * FROM comp_runs WHERE user_id = $1 AND project_id = $2 AND iteration = $3",
        )
        .bind(key.user_id)
        .bind(key.project_id)
        .bind(key.iteration)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn find_active_run(&self, project_id: ProjectId) -> StoreResult<Option<PipelineRun>> {
        let row = sqlx::query(
            "SELECT * FROM comp_runs
             WHERE project_id = $1 AND state <> ALL($2)
             ORDER BY iteration DESC LIMIT 1",
        )
        .bind(project_id)
        .bind(TERMINAL_RUN_STATES)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_active_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        let rows = sqlx::query("SELECT * FROM comp_runs WHERE state <> ALL($1)")
            .bind(TERMINAL_RUN_STATES)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn create_run(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        cluster_id: ClusterId,
        use_on_demand_cluster: bool,
        metadata: RunMetadata,
    ) -> StoreResult<PipelineRun> {
        let mut tx = self.pool.begin().await?;

        // Lock the project's rows so two concurrent creates cannot both pass
        // the active-run check or allocate the same iteration.
        let existing = sqlx::query(
            "SELECT iteration FROM comp_runs
             WHERE project_id = $1 AND state <> ALL($2)
             FOR UPDATE",
        )
        .bind(project_id)
        .bind(TERMINAL_RUN_STATES)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(StoreError::ActiveRunExists(project_id));
        }

        let row = sqlx::query(
            "INSERT INTO comp_runs
                 (user_id, project_id, iteration, cluster_id, use_on_demand_cluster,
                  state, metadata, cancellation_requested, created_at)
             SELECT $1, $2, COALESCE(MAX(iteration), 0) + 1, $3, $4, $5, $6, FALSE, NOW()
             FROM comp_runs WHERE project_id = $2
             RETURNING *",
        )
        .bind(user_id)
        .bind(project_id)
        .bind(cluster_id)
        .bind(use_on_demand_cluster)
        .bind(RunState::Published.as_str())
        .bind(Json(&metadata))
        .fetch_one(&mut *tx)
        .await?;
        let run = Self::run_from_row(&row)?;
        tx.commit().await?;
        Ok(run)
    }

    async fn set_cancellation_requested(&self, key: &RunKey) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE comp_runs SET cancellation_requested = TRUE
             WHERE user_id = $1 AND project_id = $2 AND iteration = $3",
        )
        .bind(key.user_id)
        .bind(key.project_id)
        .bind(key.iteration)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Message(format!("run {key} not found")));
        }
        Ok(())
    }

    async fn get_dag(&self, project_id: ProjectId) -> StoreResult<Option<PipelineDag>> {
        let row = sqlx::query("SELECT dag FROM comp_pipelines WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let dag: Json<PipelineDag> = row.try_get("dag")?;
                Ok(Some(dag.0))
            }
            None => Ok(None),
        }
    }

    async fn upsert_dag(&self, project_id: ProjectId, dag: PipelineDag) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO comp_pipelines (project_id, dag) VALUES ($1, $2)
             ON CONFLICT (project_id) DO UPDATE SET dag = EXCLUDED.dag",
        )
        .bind(project_id)
        .bind(Json(&dag))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_tasks(&self, project_id: ProjectId) -> StoreResult<Vec<PipelineTask>> {
        let rows = sqlx::query("SELECT * FROM comp_tasks WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::task_from_row).collect()
    }

    async fn upsert_task(&self, task: PipelineTask) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        upsert_tasks(&mut tx, std::slice::from_ref(&task)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_task_by_job_id(&self, job_id: &JobId) -> StoreResult<Option<PipelineTask>> {
        let row = sqlx::query("SELECT * FROM comp_tasks WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn mark_tasks_published(&self, project_id: ProjectId) -> StoreResult<()> {
        sqlx::query(
            "UPDATE comp_tasks SET
                 state = $2, job_id = NULL, progress = NULL, started_emitted = FALSE,
                 last_heartbeat = NULL, started_at = NULL, ended_at = NULL,
                 errors = '[]'::jsonb
             WHERE project_id = $1",
        )
        .bind(project_id)
        .bind(TaskState::Published.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_pass_update(&self, update: PassUpdate) -> StoreResult<()> {
        let run = &update.run;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE comp_runs SET
                 state = $4, metadata = $5, cancellation_requested = $6,
                 cluster_wait_since = $7, started_at = $8, ended_at = $9
             WHERE user_id = $1 AND project_id = $2 AND iteration = $3",
        )
        .bind(run.user_id)
        .bind(run.project_id)
        .bind(run.iteration)
        .bind(run.state.as_str())
        .bind(Json(&run.metadata))
        .bind(run.cancellation_requested)
        .bind(run.cluster_wait_since)
        .bind(run.started_at)
        .bind(run.ended_at)
        .execute(&mut *tx)
        .await?;

        upsert_tasks(&mut tx, &update.tasks).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_tasks(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    tasks: &[PipelineTask],
) -> StoreResult<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO comp_tasks
             (project_id, node_id, job_id, image, state, progress, node_class,
              started_emitted, last_heartbeat, started_at, ended_at, errors) ",
    );
    builder.push_values(tasks.iter(), |mut b, task| {
        b.push_bind(task.project_id)
            .push_bind(task.node_id)
            .push_bind(task.job_id.as_deref())
            .push_bind(Json(&task.image))
            .push_bind(task.state.as_str())
            .push_bind(task.progress)
            .push_bind(task.node_class.as_str())
            .push_bind(task.started_emitted)
            .push_bind(task.last_heartbeat)
            .push_bind(task.started_at)
            .push_bind(task.ended_at)
            .push_bind(Json(&task.errors));
    });
    builder.push(
        " ON CONFLICT (project_id, node_id) DO UPDATE SET
             job_id = EXCLUDED.job_id,
             image = EXCLUDED.image,
             state = EXCLUDED.state,
             progress = EXCLUDED.progress,
             node_class = EXCLUDED.node_class,
             started_emitted = EXCLUDED.started_emitted,
             last_heartbeat = EXCLUDED.last_heartbeat,
             started_at = EXCLUDED.started_at,
             ended_at = EXCLUDED.ended_at,
             errors = EXCLUDED.errors",
    );
    builder.build().execute(&mut **tx).await?;
    Ok(())
}
