//! Planner connectivity endpoints

use avocado_ai::{PlannerClient as _, PlannerConnector as _};
use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

pub async fn test_ai(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let config = state.engine.config_store().load()?;
    let planner = state.engine.planner().connect(&config.ai);
    let (ok, message) = planner.test().await;
    Ok(Json(json!({ "ok": ok, "message": message })))
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let config = state.engine.config_store().load()?;
    let planner = state.engine.planner().connect(&config.ai);
    let models = planner
        .list_models()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(json!({ "models": models })))
}
