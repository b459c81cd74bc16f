//! Build history commands.

use anyhow::Result;
use lockstep_core::{BuildId, Page, Pagination, VisibilityScope};
use lockstep_db::{BuildRepo, PgBuildRepo};

use super::Context;

pub fn scope(teams: Vec<String>, all: bool, public: bool) -> VisibilityScope {
    if all {
        VisibilityScope::All
    } else if public || teams.is_empty() {
        VisibilityScope::Public
    } else {
        VisibilityScope::Teams(teams)
    }
}

fn cursor_args(page: &Page) -> String {
    let mut args = Vec::new();
    if let Some(from) = page.from {
        args.push(format!("--from {}", from));
    }
    if let Some(to) = page.to {
        args.push(format!("--to {}", to));
    }
    args.push(format!("--limit {}", page.limit));
    if page.use_date {
        args.push("--by-date".to_string());
    }
    args.join(" ")
}

fn print_cursors(pagination: &Pagination) {
    if let Some(previous) = &pagination.previous {
        println!("newer: {}", cursor_args(previous));
    }
    if let Some(next) = &pagination.next {
        println!("older: {}", cursor_args(next));
    }
}

pub async fn list(ctx: &Context, scope: &VisibilityScope, page: &Page, json: bool) -> Result<()> {
    let repo = PgBuildRepo::new(ctx.pool().await?);
    let (builds, pagination) = repo.builds(scope, page).await?;

    if json {
        let out = serde_json::json!({
            "builds": builds,
            "pagination": pagination,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if builds.is_empty() {
        println!("No builds found");
        return Ok(());
    }

    println!(
        "{:<8} {:<24} {:<8} {:<10} {:<6} {}",
        "ID", "JOB", "NAME", "STATUS", "KEPT", "CREATED"
    );
    for build in &builds {
        println!(
            "{:<8} {:<24} {:<8} {:<10} {:<6} {}",
            build.id.to_string(),
            build.job_name.as_deref().unwrap_or("(one-off)"),
            build.name,
            build.status.as_str(),
            if build.interceptible { "yes" } else { "no" },
            build.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    print_cursors(&pagination);
    Ok(())
}

pub async fn abort(ctx: &Context, id: i64) -> Result<()> {
    let repo = PgBuildRepo::new(ctx.pool().await?);
    let id = BuildId::new(id);
    let abort_url = repo.abort(id).await?;

    let status = repo
        .build(id)
        .await?
        .map(|b| b.status.as_str())
        .unwrap_or("unknown");
    println!("Build {} is {}", id, status);
    if let Some(url) = abort_url {
        println!("Send the abort request to {}", url);
    }
    Ok(())
}
