//! Wiring of the ingest pipeline from configuration

use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use larder_common::config::PipelineConfig;
use larder_common::events::{EventBus, ProgressBroadcaster};
use larder_common::Result;

use crate::cache::{CacheOptions, ResultCache, SqliteSharedStore};
use crate::db::SqliteUnitStore;
use crate::dispatch::{Backoff, Dispatcher, EnqueueOptions, Job, WorkerPool};
use crate::gate::{CompletionGate, GateSettings, SqliteStageFlagStore};
use crate::parser::{LineParser, ParseOptions};
use crate::tracker::{CompletionTracker, SqliteProgressStore};
use crate::unit::{GateJobHandler, NoteImporter, UnitProcessor, GATE_QUEUE, INGREDIENT_QUEUE};

/// Running pipeline components
pub struct Pipeline {
    pub cache: Arc<ResultCache>,
    pub parser: Arc<LineParser>,
    pub tracker: Arc<CompletionTracker>,
    pub gate: Arc<CompletionGate>,
    pub units: Arc<SqliteUnitStore>,
    pub importer: Arc<NoteImporter>,
    pub pool: WorkerPool,
    pub events: EventBus,
    downstream_queue: String,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build every component over `db` and start workers and sweepers
    pub fn start(config: &PipelineConfig, db: SqlitePool, events: EventBus) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let broadcaster: Arc<dyn ProgressBroadcaster> = Arc::new(events.clone());

        let cache = Arc::new(ResultCache::new(
            config.cache.memory_capacity,
            Arc::new(SqliteSharedStore::new(db.clone())),
        ));
        let parser = Arc::new(LineParser::new(
            cache.clone(),
            CacheOptions::from(&config.cache),
            broadcaster.clone(),
        ));
        let tracker = Arc::new(CompletionTracker::new(
            Arc::new(SqliteProgressStore::new(db.clone())),
            broadcaster.clone(),
        ));

        let settings = GateSettings::from(&config.gate);
        let downstream_queue = settings.downstream_queue.clone();
        let pool = WorkerPool::new(
            &[INGREDIENT_QUEUE, GATE_QUEUE, downstream_queue.as_str()],
            shutdown.child_token(),
        );
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(pool.clone());

        let gate = Arc::new(CompletionGate::new(
            tracker.clone(),
            Arc::new(SqliteStageFlagStore::new(db.clone())),
            dispatcher.clone(),
            broadcaster.clone(),
            settings,
        ));
        let units = Arc::new(SqliteUnitStore::new(db));

        let parse_options = ParseOptions {
            cache_results: config.parser.cache_results,
            confidence_threshold: config.parser.confidence_threshold,
            ..ParseOptions::default()
        };
        let unit_options = EnqueueOptions::new(
            config.workers.unit_attempts,
            Backoff::Exponential {
                delay_ms: config.workers.unit_backoff_ms,
            },
        );
        let importer = Arc::new(NoteImporter::new(
            tracker.clone(),
            gate.clone(),
            dispatcher,
            broadcaster,
            parse_options,
            unit_options,
            unit_options,
        ));

        pool.spawn_workers(
            Arc::new(UnitProcessor::new(
                parser.clone(),
                units.clone(),
                tracker.clone(),
                gate.clone(),
            )),
            config.workers.pool_size,
        )?;
        pool.spawn_workers(
            Arc::new(GateJobHandler::new(gate.clone())),
            config.workers.pool_size,
        )?;

        let mut background = Vec::new();
        background.push(tracker.spawn_sweeper(
            config.tracker.sweep_interval(),
            config.tracker.eviction_timeout(),
            shutdown.child_token(),
        ));
        background.push(spawn_cache_purge(
            cache.clone(),
            config.tracker.sweep_interval(),
            shutdown.child_token(),
        ));

        info!(
            workers = config.workers.pool_size,
            downstream_queue = %downstream_queue,
            "Ingest pipeline started"
        );

        Ok(Self {
            cache,
            parser,
            tracker,
            gate,
            units,
            importer,
            pool,
            events,
            downstream_queue,
            shutdown,
            background: Mutex::new(background),
        })
    }

    /// Jobs scheduled for the next stage; can be taken once
    pub fn take_downstream(&self) -> Result<mpsc::UnboundedReceiver<Job>> {
        self.pool.take_receiver(&self.downstream_queue)
    }

    pub fn downstream_queue(&self) -> &str {
        &self.downstream_queue
    }

    /// Stop workers and background tasks
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
        let handles: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut background) => background.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Ingest pipeline stopped");
    }
}

fn spawn_cache_purge(
    cache: Arc<ResultCache>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match cache.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "Purged expired cache entries"),
                        Err(e) => warn!(error = %e, "Cache purge failed"),
                    }
                }
            }
        }
    })
}
