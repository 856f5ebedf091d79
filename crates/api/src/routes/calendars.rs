//! Calendar listing and rule management

use avocado_caldav::{CalDavClient as _, CalDavConnector as _};
use avocado_core::models::{CalendarRole, normalize_calendar_id};
use avocado_sync::{classify_calendars, keyword_suggested_calendar_ids};
use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::AppState;
use crate::error::ApiError;

/// List every calendar with its computed role annotations, resolving the
/// three managed calendars (and persisting their ids) on the way.
pub async fn list_calendars(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = state.engine.config_store();
    let mut config = store.load()?;
    if !config.caldav.is_complete() {
        return Err(ApiError::BadRequest(
            "CalDAV is not configured".to_string(),
        ));
    }
    let client = state.engine.caldav().connect(&config.caldav)?;

    let rules = config.calendar_rules.clone();
    let stage = client
        .ensure_calendar(&rules.staging_calendar_id, &rules.staging_calendar_name)
        .await?;
    let user = client
        .ensure_calendar(&rules.user_calendar_id, &rules.user_calendar_name)
        .await?;
    let intake = client
        .ensure_calendar(&rules.intake_calendar_id, &rules.intake_calendar_name)
        .await?;

    let mut patch = serde_json::Map::new();
    if stage.calendar_id != rules.staging_calendar_id {
        patch.insert("staging_calendar_id".to_string(), json!(stage.calendar_id));
    }
    if user.calendar_id != rules.user_calendar_id {
        patch.insert("user_calendar_id".to_string(), json!(user.calendar_id));
    }
    if intake.calendar_id != rules.intake_calendar_id {
        patch.insert("intake_calendar_id".to_string(), json!(intake.calendar_id));
    }
    if !patch.is_empty() {
        config = store.update(&json!({ "calendar_rules": patch }))?;
    }

    let calendars = client.list_calendars().await?;
    let managed = avocado_sync::ManagedCalendars {
        stage,
        user,
        intake,
    };
    let classified = classify_calendars(&config, &calendars, &managed);
    let suggested = keyword_suggested_calendar_ids(&config, &calendars);

    let defaults = &config.calendar_rules.per_calendar_defaults;
    let mut output = Vec::with_capacity(classified.len());
    for (calendar, role) in classified {
        let key = normalize_calendar_id(&calendar.calendar_id);
        let behavior = defaults.get(&key);
        let (managed_duplicate, duplicate_role) = match role {
            CalendarRole::ManagedDuplicate(managed_role) => (true, managed_role.as_str()),
            _ => (false, ""),
        };
        let immutable_selected = role == CalendarRole::Immutable;
        output.push(json!({
            "calendar_id": calendar.calendar_id,
            "name": calendar.name,
            "url": calendar.url,
            "immutable_suggested": suggested.contains(&key),
            "immutable_selected": immutable_selected,
            "is_staging": role == CalendarRole::Stage,
            "is_user": role == CalendarRole::User,
            "is_intake": role == CalendarRole::Intake,
            "managed_duplicate": managed_duplicate,
            "managed_duplicate_role": duplicate_role,
            "default_locked": behavior.map(|b| b.locked).unwrap_or(config.task_defaults.locked),
            "default_mandatory": behavior.map(|b| b.mandatory).unwrap_or(config.task_defaults.mandatory),
            "mode": if immutable_selected { "immutable" } else { "editable" },
        }));
    }
    Ok(Json(json!({ "calendars": output })))
}

#[derive(Debug, Deserialize)]
pub struct CalendarRulesUpdateRequest {
    #[serde(default)]
    pub immutable_keywords: Vec<String>,
    #[serde(default)]
    pub immutable_calendar_ids: Vec<String>,
    #[serde(default)]
    pub staging_calendar_id: String,
    #[serde(default)]
    pub staging_calendar_name: Option<String>,
    #[serde(default)]
    pub user_calendar_id: String,
    #[serde(default)]
    pub user_calendar_name: Option<String>,
    #[serde(default)]
    pub intake_calendar_id: String,
    #[serde(default)]
    pub intake_calendar_name: Option<String>,
    #[serde(default)]
    pub per_calendar_defaults: BTreeMap<String, Value>,
}

pub async fn put_calendar_rules(
    State(state): State<AppState>,
    Json(request): Json<CalendarRulesUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut rules = serde_json::Map::new();
    rules.insert(
        "immutable_keywords".to_string(),
        json!(request.immutable_keywords),
    );
    rules.insert(
        "immutable_calendar_ids".to_string(),
        json!(request.immutable_calendar_ids),
    );
    rules.insert(
        "staging_calendar_id".to_string(),
        json!(request.staging_calendar_id),
    );
    rules.insert(
        "user_calendar_id".to_string(),
        json!(request.user_calendar_id),
    );
    rules.insert(
        "intake_calendar_id".to_string(),
        json!(request.intake_calendar_id),
    );
    rules.insert(
        "per_calendar_defaults".to_string(),
        json!(request.per_calendar_defaults),
    );
    if let Some(name) = request.staging_calendar_name {
        rules.insert("staging_calendar_name".to_string(), json!(name));
    }
    if let Some(name) = request.user_calendar_name {
        rules.insert("user_calendar_name".to_string(), json!(name));
    }
    if let Some(name) = request.intake_calendar_name {
        rules.insert("intake_calendar_name".to_string(), json!(name));
    }

    let updated = state
        .engine
        .config_store()
        .update(&json!({ "calendar_rules": rules }))?;
    Ok(Json(json!({
        "message": "calendar rules updated",
        "calendar_rules": serde_json::to_value(&updated.calendar_rules)
            .unwrap_or(Value::Null),
    })))
}
