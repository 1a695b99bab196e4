use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fitdash_storage::PgStore;
use fitdash_sync::{EngineConfig, TaskEngine};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "fitdash-cli")]
#[command(about = "Fitness dashboard task engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every due task once, or one named task regardless of schedule.
    Run {
        #[arg(long)]
        task: Option<String>,
    },
    /// Run on the configured cron until interrupted.
    Schedule,
    Migrate,
    Serve,
    /// Clear a task's consecutive failures.
    Reset {
        #[arg(long)]
        task: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FITDASH_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let layer = if json {
        fmt::layer().with_target(true).json().with_filter(filter).boxed()
    } else {
        fmt::layer().with_target(true).with_filter(filter).boxed()
    };
    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("tracing subscriber already initialised");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { task: None }) {
        Commands::Run { task } => {
            let summary = fitdash_sync::run_once_from_env(task.as_deref()).await?;
            println!(
                "run complete: run_id={} {}",
                summary.run_id,
                summary.event_description()
            );
        }
        Commands::Schedule => {
            let config = EngineConfig::from_env();
            let engine = Arc::new(TaskEngine::connect(config).await?);
            match Arc::clone(&engine).maybe_build_scheduler().await? {
                Some(mut sched) => {
                    sched.start().await.context("starting scheduler")?;
                    tracing::info!("scheduler started; waiting for ctrl-c");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    sched.shutdown().await.context("stopping scheduler")?;
                }
                None => {
                    tracing::warn!("scheduler disabled (FITDASH_SCHEDULER_ENABLED); running once");
                    let summary = engine.run_once(None).await?;
                    println!("run complete: {}", summary.event_description());
                }
            }
        }
        Commands::Migrate => {
            let config = EngineConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            fitdash_web::serve_from_env().await?;
        }
        Commands::Reset { task } => {
            let engine = TaskEngine::connect(EngineConfig::from_env()).await?;
            if engine.reset_task(&task).await? {
                println!("reset {task}");
            } else {
                anyhow::bail!("no task named {task}");
            }
        }
    }

    Ok(())
}
