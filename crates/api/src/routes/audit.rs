//! Audit trail, undo, and revise
//!
//! Undo restores the `before` image captured by an `apply_ai_change` audit
//! event; revise applies a caller-supplied patch instead. Both require the
//! live etag to still equal the audit event's `expected_etag` and answer
//! with a version conflict otherwise.

use avocado_caldav::{CalDavClient as _, CalDavConnector as _};
use avocado_core::models::{EventRecord, parse_iso_datetime};
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

const APPLY_AI_CHANGE: &str = "apply_ai_change";

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
}

fn default_audit_limit() -> i64 {
    100
}

pub async fn audit_events(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let rows = state
        .engine
        .state()
        .recent_audit_events(query.limit)
        .await?;
    let events: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "id": row.id,
                "run_id": row.run_id,
                "created_at": row.created_at,
                "calendar_id": row.calendar_id,
                "uid": row.uid,
                "action": row.action,
                "details": row.details(),
            })
        })
        .collect();
    Ok(Json(json!({ "events": events })))
}

struct UndoTarget {
    calendar_id: String,
    uid: String,
    before: EventRecord,
    expected_etag: String,
}

async fn load_apply_target(state: &AppState, audit_id: i64) -> Result<UndoTarget, ApiError> {
    let row = state.engine.state().get_audit_event(audit_id).await?;
    if row.action != APPLY_AI_CHANGE {
        return Err(ApiError::BadRequest(format!(
            "audit event {audit_id} is '{}', only '{APPLY_AI_CHANGE}' can be undone or revised",
            row.action
        )));
    }
    let details = row.details();
    let before: EventRecord = serde_json::from_value(details["before"].clone())
        .map_err(|e| ApiError::BadRequest(format!("audit event carries no before image: {e}")))?;
    let expected_etag = details["expected_etag"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    Ok(UndoTarget {
        calendar_id: row.calendar_id,
        uid: row.uid,
        before,
        expected_etag,
    })
}

async fn fetch_live_checked(
    state: &AppState,
    target: &UndoTarget,
) -> Result<EventRecord, ApiError> {
    let config = state.engine.config_store().load()?;
    let client = state.engine.caldav().connect(&config.caldav)?;
    let live = client
        .get_event_by_uid(&target.calendar_id, &target.uid)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "event {} no longer exists in {}",
                target.uid, target.calendar_id
            ))
        })?;
    if !target.expected_etag.is_empty() && live.etag != target.expected_etag {
        return Err(ApiError::Conflict(
            "event was modified after this change was applied".to_string(),
        ));
    }
    Ok(live)
}

pub async fn undo_change(
    State(state): State<AppState>,
    Path(audit_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let target = load_apply_target(&state, audit_id).await?;
    let live = fetch_live_checked(&state, &target).await?;

    let mut restored = live.clone();
    restored.summary = target.before.summary.clone();
    restored.description = target.before.description.clone();
    restored.location = target.before.location.clone();
    restored.start = target.before.start;
    restored.end = target.before.end;
    restored.all_day = target.before.all_day;

    let config = state.engine.config_store().load()?;
    let client = state.engine.caldav().connect(&config.caldav)?;
    let saved = client.upsert_event(&target.calendar_id, &restored).await?;

    state
        .engine
        .state()
        .record_audit_event(
            None,
            &target.calendar_id,
            &target.uid,
            "undo_ai_change",
            &json!({
                "undone_audit_id": audit_id,
                "expected_etag": target.expected_etag,
                "new_etag": saved.etag,
            }),
        )
        .await?;

    Ok(Json(json!({ "message": "change undone", "event": saved })))
}

#[derive(Debug, Deserialize, Default)]
pub struct ReviseRequest {
    pub start: Option<String>,
    pub end: Option<String>,
    pub summary: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
}

pub async fn revise_change(
    State(state): State<AppState>,
    Path(audit_id): Path<i64>,
    Json(request): Json<ReviseRequest>,
) -> Result<Json<Value>, ApiError> {
    let target = load_apply_target(&state, audit_id).await?;
    let live = fetch_live_checked(&state, &target).await?;

    let mut revised = live.clone();
    if let Some(raw) = request.start.as_deref() {
        revised.start = Some(
            parse_iso_datetime(raw)
                .map_err(|e| ApiError::BadRequest(format!("invalid start datetime: {e}")))?,
        );
    }
    if let Some(raw) = request.end.as_deref() {
        revised.end = Some(
            parse_iso_datetime(raw)
                .map_err(|e| ApiError::BadRequest(format!("invalid end datetime: {e}")))?,
        );
    }
    if let Some(summary) = request.summary {
        revised.summary = summary;
    }
    if let Some(location) = request.location {
        revised.location = location;
    }
    if let Some(description) = request.description {
        revised.description = description;
    }

    let config = state.engine.config_store().load()?;
    let client = state.engine.caldav().connect(&config.caldav)?;
    let saved = client.upsert_event(&target.calendar_id, &revised).await?;

    state
        .engine
        .state()
        .record_audit_event(
            None,
            &target.calendar_id,
            &target.uid,
            "revise_ai_change",
            &json!({
                "revised_audit_id": audit_id,
                "expected_etag": target.expected_etag,
                "new_etag": saved.etag,
            }),
        )
        .await?;

    Ok(Json(json!({ "message": "change revised", "event": saved })))
}
