//! Lockstep command line.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Context;

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(about = "Lockstep CI scheduling core", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "LOCKSTEP_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string; overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "LOCKSTEP_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "pipeline.kdl")]
        path: PathBuf,
    },
    /// Create or reconfigure a pipeline
    Apply {
        /// Owning team; created if it does not exist
        #[arg(long)]
        team: String,
        /// Expose the pipeline's builds to everyone
        #[arg(long)]
        public: bool,
        /// Path to the configuration file
        path: PathBuf,
    },
    /// Resolve inputs, create builds and start pending builds
    Tick {
        #[arg(long)]
        team: String,
        #[arg(long)]
        pipeline: String,
        /// Only this job; every job of the pipeline when omitted
        #[arg(long)]
        job: Option<String>,
    },
    /// Release finished builds from interception
    Sweep {
        /// Sweep once and exit instead of looping
        #[arg(long)]
        once: bool,
    },
    /// List builds, newest first
    Builds {
        /// Teams whose builds to show, along with public builds
        #[arg(long)]
        team: Vec<String>,
        /// Show every build
        #[arg(long, conflicts_with_all = ["team", "public"])]
        all: bool,
        /// Show only builds of public pipelines
        #[arg(long, conflicts_with = "team")]
        public: bool,
        #[arg(long, default_value = "25")]
        limit: usize,
        /// Lower bound (inclusive)
        #[arg(long)]
        from: Option<i64>,
        /// Upper bound (inclusive)
        #[arg(long)]
        to: Option<i64>,
        /// Bounds are unix timestamps of the creation time instead of ids
        #[arg(long)]
        by_date: bool,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Abort a pending or running build
    Abort {
        /// Build id
        id: i64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let ctx = Context::load(cli.config.as_deref(), cli.database_url)?;

    match cli.command {
        Commands::Migrate => {
            commands::migrate(&ctx).await?;
        }
        Commands::Validate { path } => {
            commands::pipelines::validate(&path)?;
        }
        Commands::Apply { team, public, path } => {
            commands::pipelines::apply(&ctx, &team, public, &path).await?;
        }
        Commands::Tick {
            team,
            pipeline,
            job,
        } => {
            commands::schedule::tick(&ctx, &team, &pipeline, job.as_deref()).await?;
        }
        Commands::Sweep { once } => {
            commands::schedule::sweep(&ctx, once).await?;
        }
        Commands::Builds {
            team,
            all,
            public,
            limit,
            from,
            to,
            by_date,
            json,
        } => {
            let scope = commands::builds::scope(team, all, public);
            let page = lockstep_core::Page {
                from,
                to,
                limit,
                use_date: by_date,
            };
            commands::builds::list(&ctx, &scope, &page, json).await?;
        }
        Commands::Abort { id } => {
            commands::builds::abort(&ctx, id).await?;
        }
    }

    Ok(())
}
