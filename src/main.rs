use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sympla_importer::config::Config;
use sympla_importer::constants::{DEFAULT_BATCH_LIST_LIMIT, DEFAULT_CONFIG_PATH, DEFAULT_LIST_LIMIT};
use sympla_importer::db::SqliteStorage;
use sympla_importer::infra::ReqwestHttp;
use sympla_importer::server::{self, AppState};
use sympla_importer::storage::Storage;
use sympla_importer::types::BatchStatus;
use sympla_importer::{logging, metrics, ImportPipeline};

#[derive(Parser)]
#[command(name = "sympla_importer")]
#[command(about = "Imports Sympla event listings and tracks each import batch")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one import from the Sympla API
    Import,
    /// Serve the events API and accept import requests
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show recent load batches
    Batches {
        #[arg(long, default_value_t = DEFAULT_BATCH_LIST_LIMIT)]
        limit: usize,
    },
    /// Show stored events, newest first
    Events {
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
}

fn shutdown_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl-C received, cancelling");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        config.storage.database_path = database;
    }

    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(&config.storage.database_path).with_context(|| {
            format!(
                "opening database {}",
                config.storage.database_path.display()
            )
        })?,
    );

    match cli.command {
        Commands::Import => {
            println!("🔄 Running Sympla import...");
            let http = Arc::new(ReqwestHttp::new(config.sympla.timeout())?);
            let pipeline = ImportPipeline::new(storage, http, config.sympla.clone());

            let cancel = CancellationToken::new();
            shutdown_on_ctrl_c(cancel.clone());

            let summary = pipeline.run(&cancel).await?;
            if summary.status != BatchStatus::Success {
                anyhow::bail!(
                    "import batch {} finished with status {}: {}",
                    summary.batch_id,
                    summary.status.label(),
                    summary.error.unwrap_or_default()
                );
            }
        }
        Commands::Serve { port } => {
            metrics::init_metrics();
            let http = Arc::new(ReqwestHttp::new(config.sympla.timeout())?);
            let pipeline = ImportPipeline::new(storage.clone(), http, config.sympla.clone());

            let shutdown = CancellationToken::new();
            shutdown_on_ctrl_c(shutdown.clone());

            let port = port.unwrap_or(config.server.port);
            info!(port, "Starting server");
            server::start_server(
                AppState {
                    storage,
                    pipeline: Arc::new(pipeline),
                    shutdown,
                },
                port,
            )
            .await?;
        }
        Commands::Batches { limit } => {
            let batches = storage.list_batches(limit).await?;
            println!("📦 {} load batch(es)", batches.len());
            for batch in batches {
                let finished = batch
                    .finished_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "   {}  started {}  finished {}  imported {}",
                    batch,
                    batch.started_at.to_rfc3339(),
                    finished,
                    batch.events_imported_count
                );
            }
        }
        Commands::Events { limit, offset } => {
            let total = storage.count_events().await?;
            let events = storage.list_events(limit, offset).await?;
            println!("🎫 Showing {} of {} event(s)", events.len(), total);
            for event in events {
                let place = match (&event.venue_name, &event.city) {
                    (Some(venue), Some(city)) => format!("{venue}, {city}"),
                    (Some(venue), None) => venue.clone(),
                    (None, Some(city)) => city.clone(),
                    (None, None) => event.event_type.label().to_string(),
                };
                println!(
                    "   [{}] {}  {}  {} / {}  ({})",
                    event.event_id,
                    event.start_date.format("%Y-%m-%d %H:%M"),
                    event.name,
                    event.category,
                    event.sub_category,
                    place
                );
            }
        }
    }

    Ok(())
}
