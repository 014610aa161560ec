//! threat-ingest CLI
//!
//! ```bash
//! threat-ingest once --output summary.json
//! threat-ingest --config config/threat-ingest.toml run --interval-hours 4
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use threat_ingest::config::ConfigLoader;
use threat_ingest::logging::init_logging;
use threat_ingest::threat_intelligence::{IngestionEventKind, InMemoryThreatStore};
use threat_ingest::Engine;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "threat-ingest")]
#[command(version)]
#[command(about = "Periodic threat-intelligence feed ingestion", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, env = "THREAT_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level / filter
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Override the configured interval
        #[arg(long)]
        interval_hours: Option<u64>,
    },
    /// Run a single ingestion cycle and print the summary as JSON
    Once {
        /// Write the summary to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Include the merged records in the summary
        #[arg(long)]
        records: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .load_from_file(cli.config.as_deref())
        .load_from_env()
        .build()?;

    if let Some(level) = cli.log_level {
        config.logging = config.logging.with_level(level);
    }
    let _log_guard = init_logging(&config.logging)?;

    let store = Arc::new(InMemoryThreatStore::new());
    let engine = Engine::from_config(&config, store.clone()).context("Failed to build ingestion engine")?;

    match cli.command {
        Commands::Once { output, records } => {
            let Some(mut summary) = engine.scheduler.run_ingestion().await else {
                anyhow::bail!("Ingestion cycle aborted");
            };
            if !records {
                summary.records.clear();
            }

            let json = serde_json::to_string_pretty(&summary)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(path = %path.display(), "Summary written");
                }
                None => println!("{}", json),
            }
        }
        Commands::Run { interval_hours } => {
            let hours = interval_hours.unwrap_or(config.scheduler.interval_hours);
            let mut events = engine.events.subscribe();

            engine.scheduler.start_every_hours(hours).await?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let IngestionEventKind::CycleCompleted { total_ingested, failed_providers, .. } = event.kind {
                                let stored = store.len().await;
                                info!(
                                    total_ingested,
                                    stored,
                                    failed = ?failed_providers,
                                    "Cycle completed"
                                );
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            engine.scheduler.stop().await;
        }
    }

    Ok(())
}
