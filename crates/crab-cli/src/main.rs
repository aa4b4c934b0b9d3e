use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crab_sync::{CrabConfig, PgRecordStore, RunSummary, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crab-cli")]
#[command(about = "CRAB address list import")]
struct Cli {
    /// YAML settings file; environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Sync,
    Import { geojson: PathBuf },
    Migrate,
    Schedule,
}

fn init_logging(json: bool, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<CrabConfig> {
    match path {
        Some(path) => CrabConfig::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => CrabConfig::from_env().context("reading settings from the environment"),
    }
}

async fn connect(config: &CrabConfig) -> Result<Arc<PgRecordStore>> {
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    println!(
        "sync complete: run_id={} features={} created={} updated={} unchanged={} staled={} skipped={} duplicates={}",
        summary.run_id,
        summary.tally.features_processed,
        summary.tally.addresses_created,
        summary.tally.addresses_updated,
        summary.tally.addresses_unchanged,
        summary.addresses_staled,
        summary.tally.features_skipped,
        summary.tally.duplicates_ignored,
    );
    info!(summary = %serde_json::to_string(summary)?, "run summary");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(cli.json_logs, &config.log_filter());

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = crab_sync::run_sync_once(config).await?;
            print_summary(&summary)?;
        }
        Commands::Import { geojson } => {
            let store = connect(&config).await?;
            let pipeline = SyncPipeline::new(config, store)?;
            let summary = pipeline.import_geojson(&geojson).await?;
            print_summary(&summary)?;
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler is disabled; set CRAB_SCHEDULER_ENABLED=1 or scheduler_enabled in the settings file");
            }
            let store = connect(&config).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
