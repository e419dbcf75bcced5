use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use herald_core::{
    clock::{SystemClock, ThreadRandom},
    config::Config,
    engine::{Engine, Services},
    registry::AccountRegistry,
};
use herald_openai::OpenAiGenerator;
use herald_sqlite::SqliteStore;
use herald_x::{XClient, XConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "herald", about = "Watch target accounts and reply to their posts")]
struct Args {
    /// Account registry JSON. Overrides HERALD_ACCOUNTS_FILE.
    #[arg(long)]
    accounts: Option<PathBuf>,

    /// SQLite database file. Overrides HERALD_DATABASE_PATH.
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the scheduler and mention monitor until Ctrl-C.
    Run,
    /// Print the batch plan and today's usage.
    Plan,
    /// Poll one batch immediately.
    Trigger { batch: usize },
    /// Poll mentions once.
    Mentions,
}

#[tokio::main]
async fn main() -> Result<()> {
    herald_core::logging::init("herald")?;
    let args = Args::parse();

    let mut cfg = Config::load()?;
    if let Some(p) = args.accounts {
        cfg.accounts_file = p;
    }
    if let Some(p) = args.database {
        cfg.database_path = p;
    }

    let registry = AccountRegistry::load(&cfg.accounts_file)
        .with_context(|| format!("loading {}", cfg.accounts_file.display()))?;
    let store = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .with_context(|| format!("opening {}", cfg.database_path.display()))?,
    );
    let social = Arc::new(XClient::new(XConfig {
        api_base: cfg.x_api_base.clone(),
        bearer_token: cfg.x_bearer_token.clone(),
        user_token: cfg.x_user_token.clone(),
    })?);
    let generator = Arc::new(OpenAiGenerator::new(
        cfg.openai_api_key.clone(),
        cfg.openai_model.clone(),
        cfg.openai_base_url.clone(),
    )?);

    let services = Services {
        social,
        generator,
        usage: store.clone(),
        interactions: store.clone(),
        conversations: store,
        clock: Arc::new(SystemClock),
        rng: Arc::new(ThreadRandom),
    };
    let engine = Engine::new(cfg.policy, registry, services, cfg.bot_handle)?;

    match args.command {
        Command::Run => {
            engine.start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutdown requested");
            engine.stop().await;
        }
        Command::Plan => {
            for b in engine.scheduler().batches() {
                println!(
                    "batch {:>2}  p{}  {:<24} every {:>5}s  {}",
                    b.index,
                    b.priority,
                    b.category,
                    b.interval.as_secs(),
                    b.handles().join(", ")
                );
            }
            let status = engine.status().await;
            if let Some(u) = status.usage {
                println!(
                    "usage today: reads {}/{}  writes {}/{}",
                    u.reads, u.limits.reads, u.writes, u.limits.writes
                );
            }
        }
        Command::Trigger { batch } => {
            let report = engine.scheduler().trigger_batch(batch).await?;
            println!("{report:#?}");
        }
        Command::Mentions => {
            let monitor = engine
                .mentions()
                .context("HERALD_BOT_HANDLE is not set")?;
            let report = monitor.poll_once().await?;
            println!("{report:#?}");
        }
    }

    Ok(())
}
