//! Build repository: creation, admission, completion, retention and history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lockstep_core::{
    Admission, AdmissionRequest, Build, BuildId, BuildInput, BuildStatus, Job, JobId, Page,
    Pagination, PipelineId, TeamId, VersionedResource, VisibilityScope, admission,
};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};

use super::version::{fetch_inputs, upsert_version};
use crate::{DbError, DbResult};
use tracing::{debug, info};

/// A build row joined with its job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct BuildRow {
    id: i64,
    name: String,
    team_id: i64,
    pipeline_id: Option<i64>,
    job_id: Option<i64>,
    job_name: Option<String>,
    status: String,
    scheduled: bool,
    interceptible: bool,
    drained: bool,
    abort_url: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BuildStatus>()
            .map_err(|e| DbError::Corrupt(format!("build {}: {}", row.id, e)))?;

        Ok(Build {
            id: BuildId::new(row.id),
            name: row.name,
            team_id: TeamId::new(row.team_id),
            pipeline_id: row.pipeline_id.map(PipelineId::new),
            job_id: row.job_id.map(JobId::new),
            job_name: row.job_name,
            status,
            scheduled: row.scheduled,
            interceptible: row.interceptible,
            drained: row.drained,
            abort_url: row.abort_url,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

pub(crate) const BUILD_SELECT: &str = r#"
    SELECT b.id, b.name, b.team_id, j.pipeline_id, b.job_id, j.name AS job_name,
           b.status, b.scheduled, b.interceptible, b.drained, b.abort_url,
           b.created_at, b.started_at, b.ended_at
    FROM builds b
    LEFT JOIN jobs j ON j.id = b.job_id
    LEFT JOIN pipelines p ON p.id = j.pipeline_id
"#;

const TERMINAL_STATUSES: &str = "('succeeded', 'failed', 'errored', 'aborted')";

fn into_builds(rows: Vec<BuildRow>) -> DbResult<Vec<Build>> {
    rows.into_iter().map(Build::try_from).collect()
}

pub(crate) async fn fetch_build<'e, E>(executor: E, id: i64) -> DbResult<Option<Build>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, BuildRow>(&format!("{BUILD_SELECT} WHERE b.id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.map(Build::try_from).transpose()
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Create a build owned directly by a team. It is named after its id.
    async fn create_one_off(&self, team_id: TeamId) -> DbResult<Build>;

    /// Create a pending build of a job with the next sequence name.
    async fn create_job_build(&self, job: &Job) -> DbResult<Build>;

    /// Create a pending job build with its inputs recorded atomically.
    async fn create_job_build_with_inputs(
        &self,
        job: &Job,
        inputs: &[(String, VersionedResource)],
    ) -> DbResult<Build>;

    async fn build(&self, id: BuildId) -> DbResult<Option<Build>>;
    async fn job_build(&self, job_id: JobId, name: &str) -> DbResult<Option<Build>>;

    /// Builds of a job, newest first.
    async fn job_builds(&self, job_id: JobId) -> DbResult<Vec<Build>>;

    /// Oldest pending build of a job together with its inputs.
    async fn next_pending_build(&self, job_id: JobId)
    -> DbResult<Option<(Build, Vec<BuildInput>)>>;

    /// The build a job is "on": the newest started build, else the oldest
    /// pending one, else the newest build.
    async fn current_build(&self, job_id: JobId) -> DbResult<Option<Build>>;

    /// Atomically check the serial groups and start the build if allowed.
    async fn admit(&self, request: &AdmissionRequest) -> DbResult<Admission>;

    /// Record completion. Rejects anything but a valid move into a terminal status.
    async fn finish(&self, id: BuildId, status: BuildStatus) -> DbResult<Build>;

    /// Abort a build, returning the abort endpoint to notify, if any.
    /// Aborting a finished build is a no-op.
    async fn abort(&self, id: BuildId) -> DbResult<Option<String>>;

    async fn set_drained(&self, id: BuildId, drained: bool) -> DbResult<()>;

    /// Finished builds whose artifacts have not been drained yet.
    async fn drainable_builds(&self) -> DbResult<Vec<Build>>;

    /// Running builds across all pipelines.
    async fn started_builds(&self) -> DbResult<Vec<Build>>;

    /// Finished builds that are still interceptible.
    async fn interceptible_completed_builds(&self) -> DbResult<Vec<Build>>;

    /// The most recent finished build of every job.
    async fn latest_completed_build_ids(&self) -> DbResult<Vec<BuildId>>;

    /// Flip a build to non-interceptible. Returns whether it changed.
    async fn mark_non_interceptible(&self, id: BuildId) -> DbResult<bool>;

    /// One page of builds visible within a scope, newest first.
    async fn builds(&self, scope: &VisibilityScope, page: &Page)
    -> DbResult<(Vec<Build>, Pagination)>;

    /// Builds of the given teams plus builds of public pipelines.
    async fn visible_builds(
        &self,
        teams: &[String],
        page: &Page,
    ) -> DbResult<(Vec<Build>, Pagination)> {
        self.builds(&VisibilityScope::Teams(teams.to_vec()), page)
            .await
    }

    async fn all_builds(&self, page: &Page) -> DbResult<(Vec<Build>, Pagination)> {
        self.builds(&VisibilityScope::All, page).await
    }

    async fn public_builds(&self, page: &Page) -> DbResult<(Vec<Build>, Pagination)> {
        self.builds(&VisibilityScope::Public, page).await
    }
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_all(&self, filter: &str) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!("{BUILD_SELECT} {filter}"))
            .fetch_all(&self.pool)
            .await?;
        into_builds(rows)
    }
}

/// Bump the job's sequence and insert the build row, returning its id.
async fn insert_job_build(
    conn: &mut sqlx::PgConnection,
    job: &Job,
) -> DbResult<i64> {
    let (team_id, number): (i64, i64) = sqlx::query_as(
        r#"
        UPDATE jobs j
        SET build_number_seq = j.build_number_seq + 1
        FROM pipelines p
        WHERE j.id = $1 AND p.id = j.pipeline_id
        RETURNING p.team_id, j.build_number_seq
        "#,
    )
    .bind(job.id.get())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?;

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO builds (name, team_id, job_id) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(number.to_string())
    .bind(team_id)
    .bind(job.id.get())
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

fn push_visibility(qb: &mut QueryBuilder<'_, Postgres>, scope: &VisibilityScope) {
    match scope {
        VisibilityScope::Teams(teams) => {
            qb.push(" AND (b.team_id IN (SELECT id FROM teams WHERE name = ANY(")
                .push_bind(teams.clone())
                .push(")) OR COALESCE(p.public, FALSE))");
        }
        VisibilityScope::All => {}
        VisibilityScope::Public => {
            qb.push(" AND COALESCE(p.public, FALSE)");
        }
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create_one_off(&self, team_id: TeamId) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO builds (id, name, team_id)
            SELECT s.id, s.id::TEXT, $1
            FROM (SELECT nextval('builds_id_seq') AS id) s
            RETURNING id
            "#,
        )
        .bind(team_id.get())
        .fetch_one(&mut *tx)
        .await?;

        let build = fetch_build(&mut *tx, id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        tx.commit().await?;
        Ok(build)
    }

    async fn create_job_build(&self, job: &Job) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;
        let id = insert_job_build(&mut tx, job).await?;
        let build = fetch_build(&mut *tx, id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        tx.commit().await?;
        Ok(build)
    }

    async fn create_job_build_with_inputs(
        &self,
        job: &Job,
        inputs: &[(String, VersionedResource)],
    ) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;
        let id = insert_job_build(&mut tx, job).await?;

        for (name, versioned_resource) in inputs {
            let version_id = upsert_version(&mut *tx, job.pipeline_id, versioned_resource, false).await?;
            sqlx::query(
                r#"
                INSERT INTO build_inputs (build_id, versioned_resource_id, name)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(id)
            .bind(version_id.get())
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }

        let build = fetch_build(&mut *tx, id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        tx.commit().await?;
        Ok(build)
    }

    async fn build(&self, id: BuildId) -> DbResult<Option<Build>> {
        fetch_build(&self.pool, id.get()).await
    }

    async fn job_build(&self, job_id: JobId, name: &str) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "{BUILD_SELECT} WHERE b.job_id = $1 AND b.name = $2"
        ))
        .bind(job_id.get())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Build::try_from).transpose()
    }

    async fn job_builds(&self, job_id: JobId) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "{BUILD_SELECT} WHERE b.job_id = $1 ORDER BY b.id DESC"
        ))
        .bind(job_id.get())
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn next_pending_build(
        &self,
        job_id: JobId,
    ) -> DbResult<Option<(Build, Vec<BuildInput>)>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "{BUILD_SELECT} WHERE b.job_id = $1 AND b.status = 'pending' ORDER BY b.id ASC LIMIT 1"
        ))
        .bind(job_id.get())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let build = Build::try_from(row)?;
        let inputs = fetch_inputs(&self.pool, build.id).await?;
        Ok(Some((build, inputs)))
    }

    async fn current_build(&self, job_id: JobId) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"{BUILD_SELECT}
            WHERE b.job_id = $1
            ORDER BY
                CASE b.status WHEN 'started' THEN 0 WHEN 'pending' THEN 1 ELSE 2 END,
                CASE WHEN b.status = 'pending' THEN b.id ELSE -b.id END
            LIMIT 1"#
        ))
        .bind(job_id.get())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Build::try_from).transpose()
    }

    async fn admit(&self, request: &AdmissionRequest) -> DbResult<Admission> {
        let mut tx = self.pool.begin().await?;

        let mut groups = request.serial_groups.clone();
        groups.sort();
        groups.dedup();

        if let Some(pipeline_id) = request.pipeline_id {
            for group in &groups {
                sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, $2))")
                    .bind(format!("serial-group:{}", group))
                    .bind(pipeline_id.get())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let candidate = sqlx::query_as::<_, BuildRow>(&format!(
            "{BUILD_SELECT} WHERE b.id = $1 FOR UPDATE OF b"
        ))
        .bind(request.build_id.get())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", request.build_id)))?;
        let candidate = Build::try_from(candidate)?;

        let group_builds = match request.pipeline_id {
            Some(pipeline_id) if !groups.is_empty() => {
                let rows = sqlx::query_as::<_, BuildRow>(&format!(
                    r#"{BUILD_SELECT}
                    WHERE j.pipeline_id = $1
                      AND b.status IN ('pending', 'started')
                      AND (CASE WHEN cardinality(j.serial_groups) = 0
                                THEN ARRAY[j.name]
                                ELSE j.serial_groups END) && $2
                    ORDER BY b.id"#
                ))
                .bind(pipeline_id.get())
                .bind(&groups)
                .fetch_all(&mut *tx)
                .await?;
                into_builds(rows)?
            }
            _ => Vec::new(),
        };

        let decision = admission::decide(&candidate, &group_builds);
        if decision.is_admitted() {
            let updated = sqlx::query(
                r#"
                UPDATE builds
                SET status = 'started',
                    scheduled = TRUE,
                    started_at = NOW(),
                    abort_url = COALESCE($2, abort_url)
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(request.build_id.get())
            .bind(&request.abort_url)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                debug!(build_id = %request.build_id, "Build left pending state during admission");
                let status = fetch_build(&self.pool, request.build_id.get())
                    .await?
                    .map(|b| b.status)
                    .unwrap_or(BuildStatus::Aborted);
                return Ok(Admission::NotPending(status));
            }
        }

        tx.commit().await?;
        Ok(decision)
    }

    async fn finish(&self, id: BuildId, status: BuildStatus) -> DbResult<Build> {
        if !status.is_terminal() {
            return Err(DbError::InvalidInput(format!(
                "cannot finish build {} as {}",
                id, status
            )));
        }

        let mut tx = self.pool.begin().await?;
        let current: String =
            sqlx::query_scalar("SELECT status FROM builds WHERE id = $1 FOR UPDATE")
                .bind(id.get())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        let current = current
            .parse::<BuildStatus>()
            .map_err(|e| DbError::Corrupt(format!("build {}: {}", id, e)))?;
        let next = current.transition(status)?;

        sqlx::query("UPDATE builds SET status = $2, ended_at = NOW() WHERE id = $1")
            .bind(id.get())
            .bind(next.as_str())
            .execute(&mut *tx)
            .await?;

        let build = fetch_build(&mut *tx, id.get())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        tx.commit().await?;
        Ok(build)
    }

    async fn abort(&self, id: BuildId) -> DbResult<Option<String>> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM builds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(DbError::NotFound(format!("build {}", id)));
        }

        let abort_url: Option<Option<String>> = sqlx::query_scalar(
            r#"
            UPDATE builds
            SET status = 'aborted', ended_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'started')
            RETURNING abort_url
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;
        match &abort_url {
            Some(_) => info!(build_id = %id, "Build aborted"),
            None => debug!(build_id = %id, "Build already finished; nothing to abort"),
        }
        Ok(abort_url.flatten())
    }

    async fn set_drained(&self, id: BuildId, drained: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE builds SET drained = $2 WHERE id = $1")
            .bind(id.get())
            .bind(drained)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        Ok(())
    }

    async fn drainable_builds(&self) -> DbResult<Vec<Build>> {
        self.fetch_all(&format!(
            "WHERE b.status IN {TERMINAL_STATUSES} AND NOT b.drained ORDER BY b.id"
        ))
        .await
    }

    async fn started_builds(&self) -> DbResult<Vec<Build>> {
        self.fetch_all("WHERE b.status = 'started' ORDER BY b.id").await
    }

    async fn interceptible_completed_builds(&self) -> DbResult<Vec<Build>> {
        self.fetch_all(&format!(
            "WHERE b.interceptible AND b.status IN {TERMINAL_STATUSES} ORDER BY b.id"
        ))
        .await
    }

    async fn latest_completed_build_ids(&self) -> DbResult<Vec<BuildId>> {
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            r#"
            SELECT MAX(id)
            FROM builds
            WHERE job_id IS NOT NULL AND status IN {TERMINAL_STATUSES}
            GROUP BY job_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(BuildId::new).collect())
    }

    async fn mark_non_interceptible(&self, id: BuildId) -> DbResult<bool> {
        let result =
            sqlx::query("UPDATE builds SET interceptible = FALSE WHERE id = $1 AND interceptible")
                .bind(id.get())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn builds(
        &self,
        scope: &VisibilityScope,
        page: &Page,
    ) -> DbResult<(Vec<Build>, Pagination)> {
        let limit = page.effective_limit();
        let key = if page.use_date {
            "FLOOR(EXTRACT(EPOCH FROM b.created_at))::BIGINT"
        } else {
            "b.id"
        };

        let mut qb = QueryBuilder::<Postgres>::new(format!("{BUILD_SELECT} WHERE TRUE"));
        push_visibility(&mut qb, scope);
        if let Some(from) = page.from {
            qb.push(format!(" AND {key} >= ")).push_bind(from);
        }
        if let Some(to) = page.to {
            qb.push(format!(" AND {key} <= ")).push_bind(to);
        }
        if page.anchored_at_from() {
            qb.push(" ORDER BY b.id ASC");
        } else {
            qb.push(" ORDER BY b.id DESC");
        }
        qb.push(" LIMIT ").push_bind(page.sql_limit());

        let rows = qb.build_query_as::<BuildRow>().fetch_all(&self.pool).await?;
        let mut builds = into_builds(rows)?;
        if page.anchored_at_from() {
            builds.reverse();
        }

        let (Some(newest), Some(oldest)) = (builds.first(), builds.last()) else {
            return Ok((builds, Pagination::default()));
        };
        let (newest, oldest) = (newest.id.get(), oldest.id.get());

        let mut newer = QueryBuilder::<Postgres>::new(
            "SELECT EXISTS (SELECT 1 FROM builds b LEFT JOIN jobs j ON j.id = b.job_id \
             LEFT JOIN pipelines p ON p.id = j.pipeline_id WHERE TRUE",
        );
        push_visibility(&mut newer, scope);
        newer.push(" AND b.id > ").push_bind(newest).push(")");
        let has_newer: bool = newer.build_query_scalar().fetch_one(&self.pool).await?;

        let mut older = QueryBuilder::<Postgres>::new(
            "SELECT EXISTS (SELECT 1 FROM builds b LEFT JOIN jobs j ON j.id = b.job_id \
             LEFT JOIN pipelines p ON p.id = j.pipeline_id WHERE TRUE",
        );
        push_visibility(&mut older, scope);
        older.push(" AND b.id < ").push_bind(oldest).push(")");
        let has_older: bool = older.build_query_scalar().fetch_one(&self.pool).await?;

        let pagination = Pagination::around(newest, oldest, has_newer, has_older, limit);
        Ok((builds, pagination))
    }
}
