//! Pipeline commands.

use anyhow::{Context as _, Result};
use lockstep_core::PipelineConfig;
use lockstep_db::{PgPipelineRepo, PgTeamRepo, PipelineRepo, TeamRepo};
use std::path::Path;
use tracing::info;

use super::Context;

fn read_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    lockstep_config::parse_pipeline(&content)
        .with_context(|| format!("Invalid pipeline configuration in {}", path.display()))
}

pub fn validate(path: &Path) -> Result<()> {
    let config = read_pipeline(path)?;
    println!(
        "Configuration is valid: pipeline {} ({} resources, {} jobs)",
        config.name,
        config.resources.len(),
        config.jobs.len()
    );
    Ok(())
}

pub async fn apply(ctx: &Context, team: &str, public: bool, path: &Path) -> Result<()> {
    let config = read_pipeline(path)?;
    let pool = ctx.pool().await?;

    let teams = PgTeamRepo::new(pool.clone());
    let team = match teams.team_by_name(team).await? {
        Some(team) => team,
        None => {
            info!(team = %team, "Creating team");
            teams.create_team(team).await?
        }
    };

    let pipelines = PgPipelineRepo::new(pool);
    let pipeline = pipelines.save_pipeline(team.id, &config).await?;
    if public != pipeline.public {
        pipelines.set_public(pipeline.id, public).await?;
    }

    info!(
        team = %team.name,
        pipeline = %pipeline.name,
        jobs = config.jobs.len(),
        public,
        "Pipeline applied"
    );
    println!("Applied pipeline {} (id {})", pipeline.name, pipeline.id);
    Ok(())
}
