//! larder-ingest - ingredient stage of the recipe-note import pipeline
//!
//! Serves the import API, runs the unit and gate workers, and logs the
//! downstream handoff jobs it schedules.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use larder_common::config::PipelineConfig;
use larder_common::events::EventBus;
use larder_ingest::{AppState, Pipeline};

#[derive(Debug, Parser)]
#[command(name = "larder-ingest", version, about = "Recipe-note ingredient pipeline")]
struct Args {
    /// Config file (overrides LARDER_CONFIG and the platform default)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Database file (overrides LARDER_DATABASE and the config file)
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = PipelineConfig::resolve(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting larder-ingest");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database_path.display());

    let db_pool = larder_ingest::db::init_database_pool(&config.database_path).await?;
    info!("Database connection established");

    let event_bus = EventBus::new(1000);
    let pipeline = Pipeline::start(&config, db_pool, event_bus)?;

    // The next stage runs in another service; report what would be handed to it.
    let mut downstream = pipeline.take_downstream()?;
    let downstream_queue = pipeline.downstream_queue().to_string();
    tokio::spawn(async move {
        while let Some(job) = downstream.recv().await {
            info!(queue = %downstream_queue, job_id = %job.id, payload = %job.payload, "Downstream stage job ready");
        }
    });

    let pipeline = Arc::new(pipeline);
    let app = larder_ingest::build_router(AppState::new(pipeline.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on http://{}", config.bind_address);
    info!("Health check: http://{}/health", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    pipeline.shutdown().await;

    Ok(())
}
