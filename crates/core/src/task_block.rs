//! Embedded task block codec
//!
//! Policy and user intent ride along inside the event description, delimited
//! by `[AI Task]` / `[/AI Task]` lines with a YAML body. The block is a
//! typed record here; parsing is tolerant (any failure reads as "absent"),
//! and a line-level fallback still recovers `user_intent` from a block the
//! user broke mid-edit.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::config::{DEFAULT_EDITABLE_FIELDS, TaskDefaultsConfig};

pub const TASK_BLOCK_START: &str = "[AI Task]";
pub const TASK_BLOCK_END: &str = "[/AI Task]";

static TASK_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[AI Task\]\s*\n(.*?)\n\[/AI Task\]").expect("task block pattern")
});

static INTENT_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*user_intent\s*:\s*(.+)$").expect("intent line pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConstraints {
    pub earliest_start: Option<String>,
    pub latest_end: Option<String>,
    pub avoid_overlap_with_mandatory: bool,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        TaskConstraints {
            earliest_start: None,
            latest_end: None,
            avoid_overlap_with_mandatory: true,
        }
    }
}

/// Normalized task block. Field order is the emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBlock {
    pub version: u32,
    pub locked: bool,
    pub mandatory: bool,
    pub editable_fields: Vec<String>,
    pub user_intent: String,
    pub constraints: TaskConstraints,
    pub priority: String,
    pub source: String,
    pub last_editor: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub category: Option<String>,
}

impl TaskBlock {
    /// Fresh block carrying the configured defaults.
    pub fn from_defaults(defaults: &TaskDefaultsConfig) -> Self {
        TaskBlock {
            version: 1,
            locked: defaults.locked,
            mandatory: defaults.mandatory,
            editable_fields: clamp_editable_fields(&defaults.editable_fields, defaults),
            user_intent: String::new(),
            constraints: TaskConstraints::default(),
            priority: "medium".to_string(),
            source: "system".to_string(),
            last_editor: "system".to_string(),
            updated_at: Utc::now().to_rfc3339(),
            category: None,
        }
    }
}

fn clamp_editable_fields(raw: &[String], defaults: &TaskDefaultsConfig) -> Vec<String> {
    let cleaned: Vec<String> = raw
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| DEFAULT_EDITABLE_FIELDS.contains(&f.as_str()))
        .collect();
    if !cleaned.is_empty() {
        return cleaned;
    }
    let fallback: Vec<String> = defaults
        .editable_fields
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| DEFAULT_EDITABLE_FIELDS.contains(&f.as_str()))
        .collect();
    if fallback.is_empty() {
        DEFAULT_EDITABLE_FIELDS.iter().map(|f| f.to_string()).collect()
    } else {
        fallback
    }
}

fn coerce_bool(value: &serde_yaml::Value, default: bool) -> bool {
    match value {
        serde_yaml::Value::Bool(b) => *b,
        serde_yaml::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        serde_yaml::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => true,
            "false" | "no" | "0" | "" => false,
            _ => default,
        },
        _ => default,
    }
}

fn coerce_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Raw YAML mapping of the first delimited block, or `None` when the
/// description carries no block or the body does not parse.
pub fn parse_task_block(description: &str) -> Option<serde_yaml::Mapping> {
    let captures = TASK_BLOCK_RE.captures(description)?;
    let body = captures.get(1)?.as_str();
    match serde_yaml::from_str::<serde_yaml::Value>(body) {
        Ok(serde_yaml::Value::Mapping(mapping)) => Some(mapping),
        _ => None,
    }
}

/// Overlay a parsed mapping onto the defaults and clamp every field.
pub fn normalize_task_block(
    parsed: &serde_yaml::Mapping,
    defaults: &TaskDefaultsConfig,
) -> TaskBlock {
    let mut block = TaskBlock::from_defaults(defaults);
    let get = |key: &str| parsed.get(key);

    if let Some(value) = get("version").and_then(|v| v.as_u64()) {
        block.version = value.min(u64::from(u32::MAX)) as u32;
    }
    if let Some(value) = get("locked") {
        block.locked = coerce_bool(value, defaults.locked);
    }
    if let Some(value) = get("mandatory") {
        block.mandatory = coerce_bool(value, defaults.mandatory);
    }
    if let Some(serde_yaml::Value::Sequence(raw)) = get("editable_fields") {
        let fields: Vec<String> = raw.iter().filter_map(coerce_string).collect();
        block.editable_fields = clamp_editable_fields(&fields, defaults);
    }
    if let Some(value) = get("user_intent").and_then(coerce_string) {
        block.user_intent = value;
    }
    if let Some(serde_yaml::Value::Mapping(raw)) = get("constraints") {
        let sub = |key: &str| raw.get(key);
        if let Some(value) = sub("earliest_start") {
            block.constraints.earliest_start = coerce_string(value);
        }
        if let Some(value) = sub("latest_end") {
            block.constraints.latest_end = coerce_string(value);
        }
        if let Some(value) = sub("avoid_overlap_with_mandatory") {
            block.constraints.avoid_overlap_with_mandatory = coerce_bool(value, true);
        }
    }
    if let Some(value) = get("priority").and_then(coerce_string) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            block.priority = trimmed;
        }
    }
    if let Some(value) = get("source").and_then(coerce_string) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            block.source = trimmed;
        }
    }
    if let Some(value) = get("last_editor").and_then(coerce_string) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            block.last_editor = trimmed;
        }
    }
    if let Some(value) = get("updated_at").and_then(coerce_string) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            block.updated_at = trimmed;
        }
    }
    if let Some(value) = get("category").and_then(coerce_string) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            block.category = Some(trimmed);
        }
    }
    block
}

/// Serialize a block between its delimiters.
pub fn emit_task_block(block: &TaskBlock) -> String {
    let body = serde_yaml::to_string(block).unwrap_or_default();
    format!("{TASK_BLOCK_START}\n{}\n{TASK_BLOCK_END}", body.trim_end())
}

/// Remove the block from a description, keeping the human text.
pub fn strip_task_block(description: &str) -> String {
    TASK_BLOCK_RE.replace_all(description, "").trim().to_string()
}

/// Replace the existing block in place, or append one after a blank line.
pub fn upsert_task_block(description: &str, block: &TaskBlock) -> String {
    let rendered = emit_task_block(block);
    if description.trim().is_empty() {
        return rendered;
    }
    if TASK_BLOCK_RE.is_match(description) {
        return TASK_BLOCK_RE
            .replace(description, regex::NoExpand(rendered.as_str()))
            .trim()
            .to_string();
    }
    format!("{}\n\n{}", description.trim_end(), rendered)
}

/// Parse-normalize-reemit. `changed` reports whether the description text
/// differs afterwards, which is the write-back condition.
pub fn ensure_task_block(
    description: &str,
    defaults: &TaskDefaultsConfig,
) -> (String, TaskBlock, bool) {
    let block = match parse_task_block(description) {
        Some(parsed) => normalize_task_block(&parsed, defaults),
        None => TaskBlock::from_defaults(defaults),
    };
    let updated = upsert_task_block(description, &block);
    let changed = updated != description;
    (updated, block, changed)
}

/// Stamp a category into the block, normalizing on the way.
pub fn set_task_category(
    description: &str,
    defaults: &TaskDefaultsConfig,
    category: &str,
) -> (String, TaskBlock, bool) {
    let mut block = match parse_task_block(description) {
        Some(parsed) => normalize_task_block(&parsed, defaults),
        None => TaskBlock::from_defaults(defaults),
    };
    let trimmed = category.trim();
    block.category = if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    };
    let updated = upsert_task_block(description, &block);
    let changed = updated != description;
    (updated, block, changed)
}

/// Overwrite the intent (an empty string consumes it).
pub fn set_user_intent(
    description: &str,
    defaults: &TaskDefaultsConfig,
    intent: &str,
) -> (String, TaskBlock, bool) {
    let mut block = match parse_task_block(description) {
        Some(parsed) => normalize_task_block(&parsed, defaults),
        None => TaskBlock::from_defaults(defaults),
    };
    block.user_intent = intent.to_string();
    block.updated_at = Utc::now().to_rfc3339();
    let updated = upsert_task_block(description, &block);
    let changed = updated != description;
    (updated, block, changed)
}

/// Pull the intent out of a description. Falls back to a line scan inside
/// the delimiters when the YAML body is broken, so an in-flight user edit is
/// never silently discarded.
pub fn extract_user_intent(description: &str) -> String {
    if let Some(parsed) = parse_task_block(description) {
        if let Some(value) = parsed.get("user_intent").and_then(coerce_string) {
            return value.trim().to_string();
        }
        return String::new();
    }
    if let Some(captures) = TASK_BLOCK_RE.captures(description) {
        if let Some(body) = captures.get(1) {
            if let Some(line) = INTENT_LINE_RE.captures(body.as_str()) {
                if let Some(matched) = line.get(1) {
                    return matched.as_str().trim().to_string();
                }
            }
        }
    }
    // No parseable block at all: scan the raw description between the
    // delimiters (covers a broken body that the block regex cannot span).
    if let (Some(start), Some(end)) = (
        description.find(TASK_BLOCK_START),
        description.find(TASK_BLOCK_END),
    ) {
        if start < end {
            if let Some(line) = INTENT_LINE_RE.captures(&description[start..end]) {
                if let Some(matched) = line.get(1) {
                    return matched.as_str().trim().to_string();
                }
            }
        }
    }
    String::new()
}

/// Whether the description carries a non-empty user intent.
pub fn has_user_intent(description: &str) -> bool {
    !extract_user_intent(description).is_empty()
}
