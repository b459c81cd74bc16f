//! Team repository.

use async_trait::async_trait;
use lockstep_core::{Team, TeamId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A team row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct TeamRow {
    id: i64,
    name: String,
}

impl From<TeamRow> for Team {
    fn from(row: TeamRow) -> Self {
        Team {
            id: TeamId::new(row.id),
            name: row.name,
        }
    }
}

#[async_trait]
pub trait TeamRepo: Send + Sync {
    async fn create_team(&self, name: &str) -> DbResult<Team>;
    async fn team_by_name(&self, name: &str) -> DbResult<Option<Team>>;
    async fn teams(&self) -> DbResult<Vec<Team>>;
}

/// PostgreSQL implementation of TeamRepo.
pub struct PgTeamRepo {
    pool: PgPool,
}

impl PgTeamRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TeamRepo for PgTeamRepo {
    async fn create_team(&self, name: &str) -> DbResult<Team> {
        let row = sqlx::query_as::<_, TeamRow>(
            r#"
            INSERT INTO teams (name)
            VALUES ($1)
            ON CONFLICT (name) DO NOTHING
            RETURNING id, name
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::Duplicate(format!("team {}", name)))?;
        Ok(row.into())
    }

    async fn team_by_name(&self, name: &str) -> DbResult<Option<Team>> {
        let row = sqlx::query_as::<_, TeamRow>("SELECT id, name FROM teams WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Team::from))
    }

    async fn teams(&self) -> DbResult<Vec<Team>> {
        let rows = sqlx::query_as::<_, TeamRow>("SELECT id, name FROM teams ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Team::from).collect())
    }
}
