//! Configuration endpoints
//!
//! Secrets never round-trip in clear text: reads mask them and writes that
//! carry the mask (or an empty string while a secret is stored) leave the
//! stored value untouched.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ConfigUpdateRequest {
    #[serde(default)]
    pub payload: Value,
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.engine.config_store().masked()?))
}

fn sanitize_secret(section: &mut Value, field: &str, currently_set: bool) {
    let Some(object) = section.as_object_mut() else {
        return;
    };
    let Some(value) = object.get(field) else {
        return;
    };
    let text = value.as_str().unwrap_or_default().trim();
    if text.is_empty() || text == "***" {
        if currently_set {
            object.remove(field);
        } else {
            object.insert(field.to_string(), json!(""));
        }
    }
}

/// Drop masked/empty secret fields from an incoming payload so a settings
/// save from the UI cannot wipe a stored credential.
fn sanitize_config_payload(mut payload: Value, current: &Value) -> Value {
    let caldav_password_set = current
        .pointer("/caldav/password")
        .and_then(Value::as_str)
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    let ai_key_set = current
        .pointer("/ai/api_key")
        .and_then(Value::as_str)
        .map(|s| !s.is_empty())
        .unwrap_or(false);

    if let Some(section) = payload.get_mut("caldav") {
        sanitize_secret(section, "password", caldav_password_set);
    }
    if let Some(section) = payload.get_mut("ai") {
        sanitize_secret(section, "api_key", ai_key_set);
    }
    payload
}

pub async fn put_config(
    State(state): State<AppState>,
    Json(request): Json<ConfigUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    if !request.payload.is_object() {
        return Err(ApiError::BadRequest("payload must be an object".to_string()));
    }
    let store = state.engine.config_store();
    let current = store
        .load()
        .map(|config| serde_json::to_value(&config).unwrap_or(Value::Null))?;
    let sanitized = sanitize_config_payload(request.payload, &current);
    store.update(&sanitized)?;
    Ok(Json(json!({
        "message": "config updated",
        "config": store.masked()?,
    })))
}

pub async fn get_config_raw(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = state.engine.config_store();
    let config = store.load()?;
    let meta = json!({
        "caldav": {"password": {"is_masked": !config.caldav.password.is_empty()}},
        "ai": {"api_key": {"is_masked": !config.ai.api_key.is_empty()}},
    });
    Ok(Json(json!({ "config": store.masked()?, "meta": meta })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_secret_is_dropped_when_set() {
        let current = json!({"caldav": {"password": "hunter2"}, "ai": {"api_key": ""}});
        let payload = json!({
            "caldav": {"base_url": "https://dav", "password": "***"},
            "ai": {"api_key": ""},
        });
        let sanitized = sanitize_config_payload(payload, &current);
        assert!(sanitized["caldav"].get("password").is_none());
        assert_eq!(sanitized["caldav"]["base_url"], "https://dav");
        // No AI key stored: an empty incoming value stays an explicit clear.
        assert_eq!(sanitized["ai"]["api_key"], "");
    }

    #[test]
    fn test_real_secret_passes_through() {
        let current = json!({"caldav": {"password": "old"}});
        let payload = json!({"caldav": {"password": "new-secret"}});
        let sanitized = sanitize_config_payload(payload, &current);
        assert_eq!(sanitized["caldav"]["password"], "new-secret");
    }
}
