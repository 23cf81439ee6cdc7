//! Note import and status endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::gate::StageCompletionFlag;
use crate::tracker::NoteStatus;
use crate::unit::ImportReceipt;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    /// Ingredient lines in note order
    pub lines: Vec<String>,
}

/// POST /notes/:note_id/import
pub async fn import_note(
    State(state): State<AppState>,
    Path(note_id): Path<String>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<(StatusCode, Json<ImportReceipt>)> {
    info!(note_id = %note_id, lines = request.lines.len(), "Import requested");

    match state.pipeline.importer.import(&note_id, &request.lines).await {
        Ok(receipt) => Ok((StatusCode::ACCEPTED, Json(receipt))),
        Err(e) => {
            if !e.is_logic_error() {
                state.record_error(format!("import of {} failed: {}", note_id, e)).await;
            }
            Err(e.into())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteStatusResponse {
    pub note_id: String,
    /// Live progress; untracked once the stage resolves
    pub progress: NoteStatus,
    /// Ingredient stage flag, once resolved
    pub stage: Option<StageCompletionFlag>,
    pub saved_units: usize,
}

/// GET /notes/:note_id/status
pub async fn note_status(
    State(state): State<AppState>,
    Path(note_id): Path<String>,
) -> ApiResult<Json<NoteStatusResponse>> {
    let pipeline = &state.pipeline;
    let progress = pipeline.tracker.get_status(&note_id).await?;
    let stage = pipeline.gate.flag(&note_id).await?;
    let saved_units = pipeline.units.list_for_note(&note_id).await?.len();

    if progress == NoteStatus::untracked() && stage.is_none() && saved_units == 0 {
        return Err(ApiError::NotFound(format!("note {}", note_id)));
    }

    Ok(Json(NoteStatusResponse {
        note_id,
        progress,
        stage,
        saved_units,
    }))
}

/// Build note routes
pub fn note_routes() -> Router<AppState> {
    Router::new()
        .route("/notes/:note_id/import", post(import_note))
        .route("/notes/:note_id/status", get(note_status))
}
