//! Scheduling commands: per-job ticks and the retention sweep.

use anyhow::{Result, anyhow};
use lockstep_db::{PgBuildRepo, PgPipelineRepo, PgTeamRepo, PgVersionRepo, PipelineRepo, TeamRepo};
use lockstep_scheduler::{JobScheduler, RetentionSweeper};
use std::sync::Arc;
use tracing::info;

use super::Context;

pub async fn tick(ctx: &Context, team: &str, pipeline: &str, job: Option<&str>) -> Result<()> {
    let pool = ctx.pool().await?;
    let team = PgTeamRepo::new(pool.clone())
        .team_by_name(team)
        .await?
        .ok_or_else(|| anyhow!("Team {} not found", team))?;

    let pipelines = PgPipelineRepo::new(pool.clone());
    let pipeline = pipelines
        .pipeline(team.id, pipeline)
        .await?
        .ok_or_else(|| anyhow!("Pipeline {} not found", pipeline))?;

    let jobs = match job {
        Some(name) => vec![
            pipelines
                .job(pipeline.id, name)
                .await?
                .ok_or_else(|| anyhow!("Job {} not found", name))?,
        ],
        None => pipelines.jobs(pipeline.id).await?,
    };

    let scheduler = JobScheduler::new(
        Arc::new(PgBuildRepo::new(pool.clone())),
        Arc::new(PgVersionRepo::new(pool)),
    );

    for job in &jobs {
        let report = scheduler.tick(job).await?;
        let created = report
            .created
            .as_ref()
            .map(|b| b.name.as_str())
            .unwrap_or("-");
        let started = report
            .started
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<24} created: {:<8} started: {}", job.name, created, started);
    }

    Ok(())
}

pub async fn sweep(ctx: &Context, once: bool) -> Result<()> {
    let pool = ctx.pool().await?;
    let sweeper = RetentionSweeper::new(
        Arc::new(PgBuildRepo::new(pool)),
        ctx.system.retention.into(),
        ctx.system.sweep_interval,
    );

    if !once {
        sweeper.run().await;
        return Ok(());
    }

    let report = sweeper.sweep().await?;
    info!(
        examined = report.examined,
        released = report.released.len(),
        failed = report.failed.len(),
        "Retention sweep finished"
    );
    println!(
        "Examined {} builds, released {}, failed {}",
        report.examined,
        report.released.len(),
        report.failed.len()
    );
    Ok(())
}
