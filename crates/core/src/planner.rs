//! Planner payload and change shapes
//!
//! The planner sees one JSON document per run and answers with a `changes`
//! array. Everything coming back is untrusted input: changes are reduced to
//! a closed field set before the reconciler ever looks at them.

use serde::Serialize;

use crate::fingerprint::hash_text;
use crate::models::EventRecord;

pub const SYSTEM_PROMPT: &str = r#"You are Avocado, an AI schedule planner.
You must respect constraints and only return JSON in this schema:
{
  "changes": [
    {
      "calendar_id": "string",
      "uid": "string",
      "start": "ISO8601 datetime",
      "end": "ISO8601 datetime",
      "summary": "string",
      "location": "string",
      "description": "string",
      "reason": "string"
    }
  ]
}

Rules:
1. Never modify events that are locked=true or mandatory=true.
2. Only edit fields: start, end, summary, location, description.
3. Preserve user intent from [AI Task] block.
4. Keep output deterministic and concise.
"#;

#[derive(Debug, Clone, Serialize)]
pub struct PlanningWindow {
    pub start: String,
    pub end: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanningPayload {
    pub window: PlanningWindow,
    pub immutable_calendar_ids: Vec<String>,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        ChatMessage {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Assemble the planning payload. Events and calendar ids are sorted so the
/// serialized document (and its fingerprint) is deterministic.
pub fn build_planning_payload(
    mut events: Vec<EventRecord>,
    mut immutable_calendar_ids: Vec<String>,
    window_start: String,
    window_end: String,
    timezone: String,
) -> PlanningPayload {
    events.sort_by(|a, b| {
        a.calendar_id
            .cmp(&b.calendar_id)
            .then_with(|| a.uid.cmp(&b.uid))
    });
    immutable_calendar_ids.sort();
    immutable_calendar_ids.dedup();
    PlanningPayload {
        window: PlanningWindow {
            start: window_start,
            end: window_end,
            timezone,
        },
        immutable_calendar_ids,
        events,
    }
}

/// The two-message chat exchange the planner receives.
pub fn build_messages(payload: &PlanningPayload, system_prompt: &str) -> Vec<ChatMessage> {
    let prompt = if system_prompt.trim().is_empty() {
        SYSTEM_PROMPT
    } else {
        system_prompt
    };
    let body = serde_json::to_string(payload).unwrap_or_default();
    vec![
        ChatMessage::new("system", prompt),
        ChatMessage::new("user", body),
    ]
}

/// SHA-1 over the canonical JSON form, used to suppress planner calls on
/// identical scheduled payloads.
pub fn payload_fingerprint(payload: &PlanningPayload) -> String {
    hash_text(&serde_json::to_string(payload).unwrap_or_default())
}

/// One planner-proposed change after normalization. Only this closed set of
/// fields survives; anything else in the raw change is dropped.
#[derive(Debug, Clone, Default)]
pub struct PlannerChange {
    pub calendar_id: String,
    pub uid: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub summary: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub reason: Option<String>,
}

impl PlannerChange {
    /// The editable fields this change addresses, in apply order.
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.start.is_some() {
            fields.push("start");
        }
        if self.end.is_some() {
            fields.push("end");
        }
        if self.summary.is_some() {
            fields.push("summary");
        }
        if self.location.is_some() {
            fields.push("location");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        fields
    }
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reduce raw planner output to well-formed changes. Entries without a
/// non-empty `calendar_id` and `uid` are dropped; unknown keys are stripped.
pub fn normalize_changes(raw_changes: &[serde_json::Value]) -> Vec<PlannerChange> {
    let mut normalized = Vec::new();
    for item in raw_changes {
        let Some(object) = item.as_object() else {
            continue;
        };
        let calendar_id = object
            .get("calendar_id")
            .and_then(scalar_to_string)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        let uid = object
            .get("uid")
            .and_then(scalar_to_string)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        if calendar_id.is_empty() || uid.is_empty() {
            continue;
        }
        let field = |name: &str| object.get(name).and_then(scalar_to_string);
        normalized.push(PlannerChange {
            calendar_id,
            uid,
            start: field("start"),
            end: field("end"),
            summary: field("summary"),
            location: field("location"),
            description: field("description"),
            category: field("category"),
            reason: field("reason"),
        });
    }
    normalized
}
