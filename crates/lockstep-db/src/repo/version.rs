//! Versioned resources, build inputs and outputs, and history snapshots.

use async_trait::async_trait;
use lockstep_core::{
    Build, BuildId, BuildInput, BuildOutput, JobId, JobInput, MetadataField, OutputRecord,
    PipelineId, Source, Version, VersionHistory, VersionId, VersionRecord, VersionedResource,
};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use std::collections::BTreeSet;

use super::build::fetch_build;
use crate::{DbError, DbResult};

/// A versioned resource row joined with its resource name.
#[derive(Debug, Clone, sqlx::FromRow)]
struct VersionRow {
    id: i64,
    check_order: i64,
    resource: String,
    resource_type: String,
    version: Json<Version>,
    source: Json<Source>,
    metadata: Json<Vec<MetadataField>>,
}

impl From<VersionRow> for VersionRecord {
    fn from(row: VersionRow) -> Self {
        VersionRecord {
            id: VersionId::new(row.id),
            check_order: row.check_order,
            versioned_resource: VersionedResource {
                resource: row.resource,
                resource_type: row.resource_type,
                version: row.version.0,
                source: row.source.0,
                metadata: row.metadata.0,
            },
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct InputRow {
    name: String,
    first_occurrence: bool,
    #[sqlx(flatten)]
    version: VersionRow,
}

const VERSION_COLUMNS: &str = r#"
    vr.id, vr.check_order, r.name AS resource, vr.type AS resource_type,
    vr.version, vr.source, vr.metadata
"#;

/// Inputs and explicit outputs of a build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildResources {
    pub inputs: Vec<BuildInput>,
    /// Outputs that repeat one of the build's own inputs are left out.
    pub outputs: Vec<BuildOutput>,
}

/// Save a version of a pipeline resource.
///
/// With `make_latest` an existing version moves to the front of the
/// resource's history. Recording a build's inputs and outputs passes
/// `false`: a known version keeps its place and only an unseen one is
/// appended as the newest.
pub(crate) async fn upsert_version<'e, E>(
    executor: E,
    pipeline_id: PipelineId,
    versioned_resource: &VersionedResource,
    make_latest: bool,
) -> DbResult<VersionId>
where
    E: PgExecutor<'e>,
{
    let id: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO versioned_resources (resource_id, type, version, source, metadata, check_order)
        SELECT r.id, $3, $4, $5, $6, nextval('versioned_resources_check_order')
        FROM resources r
        WHERE r.pipeline_id = $1 AND r.name = $2
        ON CONFLICT (resource_id, version) DO UPDATE
        SET type = EXCLUDED.type,
            source = EXCLUDED.source,
            metadata = EXCLUDED.metadata,
            check_order = CASE WHEN $7 THEN EXCLUDED.check_order
                               ELSE versioned_resources.check_order END,
            saved_at = CASE WHEN $7 THEN NOW() ELSE versioned_resources.saved_at END
        RETURNING id
        "#,
    )
    .bind(pipeline_id.get())
    .bind(&versioned_resource.resource)
    .bind(&versioned_resource.resource_type)
    .bind(Json(&versioned_resource.version))
    .bind(Json(&versioned_resource.source))
    .bind(Json(&versioned_resource.metadata))
    .bind(make_latest)
    .fetch_optional(executor)
    .await?;

    id.map(VersionId::new).ok_or_else(|| {
        DbError::NotFound(format!(
            "resource {} in pipeline {}",
            versioned_resource.resource, pipeline_id
        ))
    })
}

/// Inputs of a build. An input is a first occurrence when no earlier build
/// of the same job consumed that version.
pub(crate) async fn fetch_inputs<'e, E>(executor: E, build_id: BuildId) -> DbResult<Vec<BuildInput>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, InputRow>(&format!(
        r#"
        SELECT bi.name,
               NOT EXISTS (
                   SELECT 1
                   FROM build_inputs obi
                   JOIN builds ob ON ob.id = obi.build_id
                   WHERE obi.versioned_resource_id = bi.versioned_resource_id
                     AND ob.job_id = b.job_id
                     AND ob.id < b.id
               ) AS first_occurrence,
               {VERSION_COLUMNS}
        FROM build_inputs bi
        JOIN builds b ON b.id = bi.build_id
        JOIN versioned_resources vr ON vr.id = bi.versioned_resource_id
        JOIN resources r ON r.id = vr.resource_id
        WHERE bi.build_id = $1
        ORDER BY bi.name, vr.id
        "#
    ))
    .bind(build_id.get())
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| BuildInput {
            name: row.name,
            first_occurrence: row.first_occurrence,
            versioned_resource: VersionRecord::from(row.version).versioned_resource,
        })
        .collect())
}

#[async_trait]
pub trait VersionRepo: Send + Sync {
    /// Save (or re-save) a version. Re-saving overwrites source and metadata.
    async fn save_versioned_resource(
        &self,
        pipeline_id: PipelineId,
        versioned_resource: &VersionedResource,
    ) -> DbResult<VersionId>;

    async fn latest_versioned_resource(
        &self,
        pipeline_id: PipelineId,
        resource: &str,
    ) -> DbResult<Option<VersionedResource>>;

    /// Record that a job build consumed a version under an input name.
    async fn save_build_input(
        &self,
        build_id: BuildId,
        name: &str,
        versioned_resource: &VersionedResource,
    ) -> DbResult<BuildInput>;

    /// Record that a job build produced a version.
    async fn save_build_output(
        &self,
        build_id: BuildId,
        versioned_resource: &VersionedResource,
    ) -> DbResult<()>;

    async fn build_resources(&self, build_id: BuildId) -> DbResult<BuildResources>;

    /// Newest build of a job that consumed exactly these named inputs.
    async fn job_build_for_inputs(
        &self,
        job_id: JobId,
        inputs: &[(String, VersionedResource)],
    ) -> DbResult<Option<Build>>;

    /// Consistent snapshot of the versions and upstream outputs the given
    /// inputs can resolve against.
    async fn version_history(
        &self,
        pipeline_id: PipelineId,
        inputs: &[JobInput],
    ) -> DbResult<VersionHistory>;
}

/// PostgreSQL implementation of VersionRepo.
pub struct PgVersionRepo {
    pool: PgPool,
}

impl PgVersionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pipeline of a job build; one-off builds cannot record versions.
    async fn build_pipeline(
        &self,
        conn: &mut sqlx::PgConnection,
        build_id: BuildId,
    ) -> DbResult<PipelineId> {
        let row: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            SELECT j.pipeline_id
            FROM builds b
            LEFT JOIN jobs j ON j.id = b.job_id
            WHERE b.id = $1
            FOR UPDATE OF b
            "#,
        )
        .bind(build_id.get())
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            None => Err(DbError::NotFound(format!("build {}", build_id))),
            Some(None) => Err(DbError::InvalidInput(format!(
                "one-off build {} cannot record resource versions",
                build_id
            ))),
            Some(Some(pipeline_id)) => Ok(PipelineId::new(pipeline_id)),
        }
    }
}

#[async_trait]
impl VersionRepo for PgVersionRepo {
    async fn save_versioned_resource(
        &self,
        pipeline_id: PipelineId,
        versioned_resource: &VersionedResource,
    ) -> DbResult<VersionId> {
        upsert_version(&self.pool, pipeline_id, versioned_resource, true).await
    }

    async fn latest_versioned_resource(
        &self,
        pipeline_id: PipelineId,
        resource: &str,
    ) -> DbResult<Option<VersionedResource>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            r#"
            SELECT {VERSION_COLUMNS}
            FROM versioned_resources vr
            JOIN resources r ON r.id = vr.resource_id
            WHERE r.pipeline_id = $1 AND r.name = $2
            ORDER BY vr.check_order DESC
            LIMIT 1
            "#
        ))
        .bind(pipeline_id.get())
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| VersionRecord::from(r).versioned_resource))
    }

    async fn save_build_input(
        &self,
        build_id: BuildId,
        name: &str,
        versioned_resource: &VersionedResource,
    ) -> DbResult<BuildInput> {
        let mut tx = self.pool.begin().await?;
        let pipeline_id = self.build_pipeline(&mut tx, build_id).await?;
        let version_id = upsert_version(&mut *tx, pipeline_id, versioned_resource, false).await?;

        sqlx::query(
            r#"
            INSERT INTO build_inputs (build_id, versioned_resource_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(build_id.get())
        .bind(version_id.get())
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let first_occurrence: bool = sqlx::query_scalar(
            r#"
            SELECT NOT EXISTS (
                SELECT 1
                FROM build_inputs bi
                JOIN builds ob ON ob.id = bi.build_id
                JOIN builds b ON b.id = $1
                WHERE bi.versioned_resource_id = $2
                  AND ob.job_id = b.job_id
                  AND ob.id < b.id
            )
            "#,
        )
        .bind(build_id.get())
        .bind(version_id.get())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(BuildInput {
            name: name.to_string(),
            versioned_resource: versioned_resource.clone(),
            first_occurrence,
        })
    }

    async fn save_build_output(
        &self,
        build_id: BuildId,
        versioned_resource: &VersionedResource,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let pipeline_id = self.build_pipeline(&mut tx, build_id).await?;
        let version_id = upsert_version(&mut *tx, pipeline_id, versioned_resource, false).await?;

        sqlx::query(
            r#"
            INSERT INTO build_outputs (build_id, versioned_resource_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(build_id.get())
        .bind(version_id.get())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn build_resources(&self, build_id: BuildId) -> DbResult<BuildResources> {
        let inputs = fetch_inputs(&self.pool, build_id).await?;

        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            r#"
            SELECT {VERSION_COLUMNS}
            FROM build_outputs bo
            JOIN versioned_resources vr ON vr.id = bo.versioned_resource_id
            JOIN resources r ON r.id = vr.resource_id
            WHERE bo.build_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM build_inputs bi
                  WHERE bi.build_id = bo.build_id
                    AND bi.versioned_resource_id = bo.versioned_resource_id
              )
            ORDER BY r.name, vr.id
            "#
        ))
        .bind(build_id.get())
        .fetch_all(&self.pool)
        .await?;

        let outputs = rows
            .into_iter()
            .map(|row| BuildOutput {
                versioned_resource: VersionRecord::from(row).versioned_resource,
            })
            .collect();

        Ok(BuildResources { inputs, outputs })
    }

    async fn job_build_for_inputs(
        &self,
        job_id: JobId,
        inputs: &[(String, VersionedResource)],
    ) -> DbResult<Option<Build>> {
        if inputs.is_empty() {
            return Ok(None);
        }

        let mut names = Vec::with_capacity(inputs.len());
        let mut resources = Vec::with_capacity(inputs.len());
        let mut versions = Vec::with_capacity(inputs.len());
        for (name, vr) in inputs {
            names.push(name.clone());
            resources.push(vr.resource.clone());
            versions.push(Json(vr.version.clone()));
        }

        let id: Option<i64> = sqlx::query_scalar(
            r#"
            WITH wanted AS (
                SELECT want.name, vr.id AS versioned_resource_id
                FROM UNNEST($2::TEXT[], $3::TEXT[], $4::JSONB[]) AS want(name, resource, version)
                JOIN jobs j ON j.id = $1
                JOIN resources r ON r.pipeline_id = j.pipeline_id AND r.name = want.resource
                JOIN versioned_resources vr ON vr.resource_id = r.id AND vr.version = want.version
            )
            SELECT b.id
            FROM builds b
            WHERE b.job_id = $1
              AND (SELECT COUNT(*) FROM wanted) = $5
              AND (
                  SELECT COUNT(*)
                  FROM build_inputs bi
                  JOIN wanted w
                    ON w.name = bi.name AND w.versioned_resource_id = bi.versioned_resource_id
                  WHERE bi.build_id = b.id
              ) = $5
            ORDER BY b.id DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.get())
        .bind(&names)
        .bind(&resources)
        .bind(&versions)
        .bind(inputs.len() as i64)
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => fetch_build(&self.pool, id).await,
            None => Ok(None),
        }
    }

    async fn version_history(
        &self,
        pipeline_id: PipelineId,
        inputs: &[JobInput],
    ) -> DbResult<VersionHistory> {
        let resources: Vec<String> = inputs
            .iter()
            .map(|i| i.resource.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let jobs: Vec<String> = inputs
            .iter()
            .flat_map(|i| i.passed.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            r#"
            SELECT {VERSION_COLUMNS}
            FROM versioned_resources vr
            JOIN resources r ON r.id = vr.resource_id
            WHERE r.pipeline_id = $1 AND r.name = ANY($2)
            ORDER BY vr.check_order DESC
            "#
        ))
        .bind(pipeline_id.get())
        .bind(&resources)
        .fetch_all(&mut *tx)
        .await?;

        let outputs: Vec<(i64, String, i64)> = if jobs.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as(
                r#"
                SELECT bo.build_id, j.name, bo.versioned_resource_id
                FROM build_outputs bo
                JOIN builds b ON b.id = bo.build_id
                JOIN jobs j ON j.id = b.job_id
                WHERE j.pipeline_id = $1 AND j.name = ANY($2)
                ORDER BY bo.build_id
                "#,
            )
            .bind(pipeline_id.get())
            .bind(&jobs)
            .fetch_all(&mut *tx)
            .await?
        };

        tx.commit().await?;

        let mut history = VersionHistory::default();
        for row in rows {
            let record = VersionRecord::from(row);
            history
                .versions
                .entry(record.versioned_resource.resource.clone())
                .or_default()
                .push(record);
        }
        history.outputs = outputs
            .into_iter()
            .map(|(build_id, job_name, version_id)| OutputRecord {
                build_id: BuildId::new(build_id),
                job_name,
                version_id: VersionId::new(version_id),
            })
            .collect();

        Ok(history)
    }
}
