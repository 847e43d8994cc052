use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pulse_sync::{build_pipeline, SourceRegistry, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Pulse event ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run {
        /// Commit this run's batch regardless of the sync cadence.
        #[arg(long)]
        force_sync: bool,
    },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Watch,
    /// List the configured sources and localities.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { force_sync: false }) {
        Commands::Run { force_sync } => {
            let summary = pulse_sync::run_once_from_env(force_sync).await?;
            println!(
                "run {} complete: fetched={} validation_dropped={} dedup_dropped={} synced={} failed={} pending={}",
                summary.run_id,
                summary.fetched_records,
                summary.validation_dropped,
                summary.url_dropped + summary.hash_dropped + summary.fuzzy_dropped,
                summary.synced,
                summary.sync_failed,
                summary.pending_buffered,
            );
        }
        Commands::Watch => {
            let config = SyncConfig::from_env()?;
            let registry = SourceRegistry::load(&config.sources_path)?;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(build_pipeline(config, registry).await?);
            let mut scheduler = pulse_sync::build_scheduler(pipeline, &cron).await?;
            scheduler.start().await?;
            info!(cron = %cron, "scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await?;
        }
        Commands::Sources => {
            let config = SyncConfig::from_env()?;
            let registry = SourceRegistry::load(&config.sources_path)?;
            for entry in &registry.sources {
                println!(
                    "{:<12} enabled={:<5} localities={}",
                    entry.source.as_str(),
                    entry.enabled,
                    entry.localities.join(", "),
                );
            }
        }
    }

    Ok(())
}
