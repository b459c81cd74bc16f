//! Pipeline repository: pipelines, their jobs and declared resources.

use async_trait::async_trait;
use lockstep_core::{Job, JobId, JobInput, Pipeline, PipelineConfig, PipelineId, TeamId};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::{DbError, DbResult};
use tracing::info;

/// A pipeline row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PipelineRow {
    id: i64,
    team_id: i64,
    name: String,
    public: bool,
}

impl From<PipelineRow> for Pipeline {
    fn from(row: PipelineRow) -> Self {
        Pipeline {
            id: PipelineId::new(row.id),
            team_id: TeamId::new(row.team_id),
            name: row.name,
            public: row.public,
        }
    }
}

/// A job row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    id: i64,
    pipeline_id: i64,
    name: String,
    serial: bool,
    serial_groups: Vec<String>,
    inputs: Json<Vec<JobInput>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: JobId::new(row.id),
            pipeline_id: PipelineId::new(row.pipeline_id),
            name: row.name,
            serial: row.serial,
            serial_groups: row.serial_groups,
            inputs: row.inputs.0,
        }
    }
}

const JOB_COLUMNS: &str = "id, pipeline_id, name, serial, serial_groups, inputs";

#[async_trait]
pub trait PipelineRepo: Send + Sync {
    /// Create or reconfigure a pipeline and register its jobs and resources.
    ///
    /// Reconfiguration only updates serial flags, serial groups and inputs of
    /// existing jobs; sequence numbers and history are kept.
    async fn save_pipeline(&self, team_id: TeamId, config: &PipelineConfig) -> DbResult<Pipeline>;
    async fn pipeline(&self, team_id: TeamId, name: &str) -> DbResult<Option<Pipeline>>;
    /// Expose (or hide) a pipeline's builds to everyone.
    async fn set_public(&self, pipeline_id: PipelineId, public: bool) -> DbResult<()>;
    async fn job(&self, pipeline_id: PipelineId, name: &str) -> DbResult<Option<Job>>;
    async fn job_by_id(&self, job_id: JobId) -> DbResult<Option<Job>>;
    async fn jobs(&self, pipeline_id: PipelineId) -> DbResult<Vec<Job>>;
}

/// PostgreSQL implementation of PipelineRepo.
pub struct PgPipelineRepo {
    pool: PgPool,
}

impl PgPipelineRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineRepo for PgPipelineRepo {
    async fn save_pipeline(&self, team_id: TeamId, config: &PipelineConfig) -> DbResult<Pipeline> {
        let mut tx = self.pool.begin().await?;

        let pipeline = sqlx::query_as::<_, PipelineRow>(
            r#"
            INSERT INTO pipelines (team_id, name)
            VALUES ($1, $2)
            ON CONFLICT (team_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, team_id, name, public
            "#,
        )
        .bind(team_id.get())
        .bind(&config.name)
        .fetch_one(&mut *tx)
        .await?;

        for resource in &config.resources {
            sqlx::query(
                r#"
                INSERT INTO resources (pipeline_id, name, type)
                VALUES ($1, $2, $3)
                ON CONFLICT (pipeline_id, name) DO UPDATE SET type = EXCLUDED.type
                "#,
            )
            .bind(pipeline.id)
            .bind(&resource.name)
            .bind(&resource.resource_type)
            .execute(&mut *tx)
            .await?;
        }

        for job in &config.jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (pipeline_id, name, serial, serial_groups, inputs)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (pipeline_id, name) DO UPDATE
                SET serial = EXCLUDED.serial,
                    serial_groups = EXCLUDED.serial_groups,
                    inputs = EXCLUDED.inputs
                "#,
            )
            .bind(pipeline.id)
            .bind(&job.name)
            .bind(job.serial)
            .bind(&job.serial_groups)
            .bind(Json(&job.inputs))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            pipeline_id = pipeline.id,
            name = %pipeline.name,
            jobs = config.jobs.len(),
            "Saved pipeline"
        );
        Ok(pipeline.into())
    }

    async fn pipeline(&self, team_id: TeamId, name: &str) -> DbResult<Option<Pipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(
            "SELECT id, team_id, name, public FROM pipelines WHERE team_id = $1 AND name = $2",
        )
        .bind(team_id.get())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pipeline::from))
    }

    async fn set_public(&self, pipeline_id: PipelineId, public: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE pipelines SET public = $2 WHERE id = $1")
            .bind(pipeline_id.get())
            .bind(public)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("pipeline {}", pipeline_id)));
        }
        Ok(())
    }

    async fn job(&self, pipeline_id: PipelineId, name: &str) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 AND name = $2"
        ))
        .bind(pipeline_id.get())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Job::from))
    }

    async fn job_by_id(&self, job_id: JobId) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Job::from))
    }

    async fn jobs(&self, pipeline_id: PipelineId) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 ORDER BY id"
        ))
        .bind(pipeline_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }
}
