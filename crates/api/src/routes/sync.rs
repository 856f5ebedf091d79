//! Run control and run history

use avocado_core::models::{Trigger, parse_iso_datetime};
use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

pub async fn trigger_sync(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.trigger_manual();
    Json(json!({ "message": "sync triggered" }))
}

#[derive(Debug, Deserialize)]
pub struct CustomWindowSyncRequest {
    pub start: String,
    pub end: String,
}

/// Run one pass over a caller-supplied window, inline.
pub async fn run_with_window(
    State(state): State<AppState>,
    Json(request): Json<CustomWindowSyncRequest>,
) -> Result<Json<Value>, ApiError> {
    let start = parse_iso_datetime(&request.start)
        .map_err(|e| ApiError::BadRequest(format!("invalid start datetime: {e}")))?;
    let end = parse_iso_datetime(&request.end)
        .map_err(|e| ApiError::BadRequest(format!("invalid end datetime: {e}")))?;
    if end < start {
        return Err(ApiError::BadRequest(
            "end must not be earlier than start".to_string(),
        ));
    }

    let outcome = state
        .engine
        .run_once(Trigger::ManualWindow, Some((start, end)))
        .await;
    Ok(Json(json!({
        "message": "sync completed",
        "result": outcome,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default = "default_status_limit")]
    pub limit: i64,
}

fn default_status_limit() -> i64 {
    20
}

pub async fn sync_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.engine.state().recent_runs(query.limit).await?;
    Ok(Json(json!({ "runs": runs })))
}
