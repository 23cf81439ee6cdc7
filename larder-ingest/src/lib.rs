//! larder-ingest library interface
//!
//! The ingredient stage of the recipe-note import pipeline: memoized line
//! parsing, fan-out of one unit per line, and an exactly-once completion
//! gate that schedules the next stage.

pub mod api;
pub mod cache;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod parser;
pub mod pipeline;
pub mod tracker;
pub mod unit;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};
pub use crate::pipeline::Pipeline;

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use larder_common::events::EventBus;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            event_bus: pipeline.events.clone(),
            pipeline,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn record_error(&self, message: String) {
        tracing::warn!(error = %message, "Recording service error");
        *self.last_error.write().await = Some(message);
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::note_routes())
        .merge(api::cache_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .with_state(state)
}
