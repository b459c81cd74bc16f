//! CLI command implementations.

pub mod builds;
pub mod pipelines;
pub mod schedule;

use anyhow::{Context as _, Result, bail};
use lockstep_config::SystemConfig;
use lockstep_db::PgPool;
use std::path::Path;
use tracing::info;

/// Settings shared by every command.
pub struct Context {
    pub system: SystemConfig,
    database_url: Option<String>,
}

impl Context {
    /// Load the system configuration. A URL given on the command line wins
    /// over the one in the file.
    pub fn load(config: Option<&Path>, database_url: Option<String>) -> Result<Self> {
        let system = match config {
            Some(path) => lockstep_config::load_system_config(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => SystemConfig::default(),
        };
        let database_url = database_url.or_else(|| system.database_url.clone());
        Ok(Self {
            system,
            database_url,
        })
    }

    pub async fn pool(&self) -> Result<PgPool> {
        let Some(url) = self.database_url.as_deref() else {
            bail!("No database configured; pass --database-url or set database_url in the config file");
        };
        lockstep_db::create_pool(url)
            .await
            .context("Failed to connect to database")
    }
}

pub async fn migrate(ctx: &Context) -> Result<()> {
    let pool = ctx.pool().await?;
    lockstep_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Migrations applied");
    Ok(())
}
