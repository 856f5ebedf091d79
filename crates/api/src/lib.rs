//! Avocado Admin API
//!
//! Single-user admin surface over the engine: configuration, calendar
//! rules, run control, run history, the audit trail, and the undo/revise
//! operations built on it.

pub mod error;
mod routes;

use axum::Router;
use axum::routing::{get, post, put};
use avocado_sync::{Scheduler, SyncEngine};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub scheduler: Arc<Scheduler>,
}

/// Build the admin router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(routes::health::healthz))
        .route(
            "/api/config",
            get(routes::config::get_config).put(routes::config::put_config),
        )
        .route("/api/config/raw", get(routes::config::get_config_raw))
        .route("/api/calendars", get(routes::calendars::list_calendars))
        .route(
            "/api/calendar-rules",
            put(routes::calendars::put_calendar_rules),
        )
        .route("/api/sync/run", post(routes::sync::trigger_sync))
        .route("/api/sync/run-window", post(routes::sync::run_with_window))
        .route("/api/sync/status", get(routes::sync::sync_status))
        .route("/api/audit/events", get(routes::audit::audit_events))
        .route("/api/audit/{id}/undo", post(routes::audit::undo_change))
        .route("/api/audit/{id}/revise", post(routes::audit::revise_change))
        .route("/api/ai/test", post(routes::ai::test_ai))
        .route("/api/ai/models", get(routes::ai::list_models))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
