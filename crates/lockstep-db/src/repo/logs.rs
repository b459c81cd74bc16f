//! Build log repository.

use async_trait::async_trait;
use lockstep_core::BuildId;
use sqlx::PgPool;

use crate::DbResult;

#[async_trait]
pub trait LogRepo: Send + Sync {
    /// Append output to a build's log.
    async fn append_log(&self, build_id: BuildId, content: &str) -> DbResult<()>;

    /// Full log of a build. Builds that never logged anything have an empty log.
    async fn log(&self, build_id: BuildId) -> DbResult<String>;
}

/// PostgreSQL implementation of LogRepo.
pub struct PgLogRepo {
    pool: PgPool,
}

impl PgLogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogRepo for PgLogRepo {
    async fn append_log(&self, build_id: BuildId, content: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_logs (build_id, content)
            VALUES ($1, $2)
            ON CONFLICT (build_id) DO UPDATE
            SET content = build_logs.content || EXCLUDED.content
            "#,
        )
        .bind(build_id.get())
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log(&self, build_id: BuildId) -> DbResult<String> {
        let content: Option<String> =
            sqlx::query_scalar("SELECT content FROM build_logs WHERE build_id = $1")
                .bind(build_id.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(content.unwrap_or_default())
    }
}
