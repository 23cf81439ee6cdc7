//! Cache diagnostics and invalidation

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// GET /cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.pipeline.cache.get_stats().await)
}

#[derive(Debug, Deserialize)]
pub struct InvalidateQuery {
    pub prefix: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: u64,
}

/// DELETE /cache?prefix=… or ?tag=…
pub async fn invalidate(
    State(state): State<AppState>,
    Query(query): Query<InvalidateQuery>,
) -> ApiResult<Json<InvalidateResponse>> {
    let cache = &state.pipeline.cache;
    let removed = match (query.prefix, query.tag) {
        (Some(prefix), None) => cache.invalidate_by_pattern(&prefix).await?,
        (None, Some(tag)) => cache.invalidate_by_tag(&tag).await?,
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of `prefix` or `tag` is required".to_string(),
            ))
        }
    };

    Ok(Json(InvalidateResponse { removed }))
}

/// Build cache routes
pub fn cache_routes() -> Router<AppState> {
    Router::new()
        .route("/cache", axum::routing::delete(invalidate))
        .route("/cache/stats", get(cache_stats))
}
