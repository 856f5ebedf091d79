//! Reconciler: apply one planner change under the policy gates
//!
//! Outcomes are a closed sum rather than exceptions; the engine records each
//! variant as its own audit action and decides what counts as a conflict.

use crate::models::{EventRecord, parse_iso_datetime};
use crate::planner::PlannerChange;
use chrono::{DateTime, Utc};

pub const APPLY_FIELD_ORDER: [&str; 5] = ["start", "end", "summary", "location", "description"];

/// Why a change was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    LockedOrMandatory,
    UserModifiedAfterPlanning,
    InvalidDatetime,
}

impl ConflictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictReason::LockedOrMandatory => "event_locked_or_mandatory",
            ConflictReason::UserModifiedAfterPlanning => "user_modified_after_planning",
            ConflictReason::InvalidDatetime => "invalid_datetime",
        }
    }
}

/// One field-level before/after entry, recorded with the audit event so the
/// admin surface can undo or revise the apply.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldPatch {
    pub field: &'static str,
    pub before: String,
    pub after: String,
}

/// Result of applying one normalized change to one user-layer event.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// At least one permitted field actually changed.
    Applied {
        event: EventRecord,
        patch: Vec<FieldPatch>,
        blocked_fields: Vec<String>,
    },
    /// Every permitted field already carried the proposed value.
    NoEffect { blocked_fields: Vec<String> },
    /// The event has no pending user intent; the planner may not touch it.
    SkippedNoIntent,
    /// Refused; the reason maps onto an audit action.
    Conflict { reason: ConflictReason },
}

/// Inputs the engine resolves before the gates run.
#[derive(Debug)]
pub struct ApplyContext<'a> {
    pub change: &'a PlannerChange,
    pub baseline_etag: &'a str,
    pub editable_fields: &'a [String],
    pub has_user_intent: bool,
}

fn iso_or_empty(value: Option<&DateTime<Utc>>) -> String {
    value.map(|dt| dt.to_rfc3339()).unwrap_or_default()
}

/// Apply `ctx.change` to `current`, honoring the gate order: lock state,
/// editable-field policy (partial applies continue), intent presence,
/// datetime validity, and the baseline etag snapshot.
pub fn apply_change(current: &EventRecord, ctx: &ApplyContext<'_>) -> ReconcileOutcome {
    if current.locked || current.mandatory {
        return ReconcileOutcome::Conflict {
            reason: ConflictReason::LockedOrMandatory,
        };
    }

    let editable: Vec<&str> = ctx
        .editable_fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| APPLY_FIELD_ORDER.contains(f))
        .collect();
    let touched = ctx.change.touched_fields();
    let blocked_fields: Vec<String> = touched
        .iter()
        .filter(|f| !editable.contains(*f))
        .map(|f| f.to_string())
        .collect();

    if !ctx.has_user_intent {
        return ReconcileOutcome::SkippedNoIntent;
    }

    let mut parsed_start: Option<DateTime<Utc>> = None;
    let mut parsed_end: Option<DateTime<Utc>> = None;
    if let Some(raw) = ctx.change.start.as_deref() {
        match parse_iso_datetime(raw) {
            Ok(parsed) => parsed_start = Some(parsed),
            Err(_) => {
                return ReconcileOutcome::Conflict {
                    reason: ConflictReason::InvalidDatetime,
                };
            }
        }
    }
    if let Some(raw) = ctx.change.end.as_deref() {
        match parse_iso_datetime(raw) {
            Ok(parsed) => parsed_end = Some(parsed),
            Err(_) => {
                return ReconcileOutcome::Conflict {
                    reason: ConflictReason::InvalidDatetime,
                };
            }
        }
    }

    if !ctx.baseline_etag.is_empty()
        && !current.etag.is_empty()
        && ctx.baseline_etag != current.etag
    {
        return ReconcileOutcome::Conflict {
            reason: ConflictReason::UserModifiedAfterPlanning,
        };
    }

    let mut updated = current.clone();
    let mut patch: Vec<FieldPatch> = Vec::new();

    for field in APPLY_FIELD_ORDER {
        if !editable.contains(&field) || !touched.contains(&field) {
            continue;
        }
        match field {
            "start" => {
                if let Some(parsed) = parsed_start {
                    if updated.start != Some(parsed) {
                        patch.push(FieldPatch {
                            field: "start",
                            before: iso_or_empty(updated.start.as_ref()),
                            after: parsed.to_rfc3339(),
                        });
                        updated.start = Some(parsed);
                    }
                }
            }
            "end" => {
                if let Some(parsed) = parsed_end {
                    if updated.end != Some(parsed) {
                        patch.push(FieldPatch {
                            field: "end",
                            before: iso_or_empty(updated.end.as_ref()),
                            after: parsed.to_rfc3339(),
                        });
                        updated.end = Some(parsed);
                    }
                }
            }
            "summary" => {
                if let Some(value) = ctx.change.summary.as_deref() {
                    if updated.summary != value {
                        patch.push(FieldPatch {
                            field: "summary",
                            before: updated.summary.clone(),
                            after: value.to_string(),
                        });
                        updated.summary = value.to_string();
                    }
                }
            }
            "location" => {
                if let Some(value) = ctx.change.location.as_deref() {
                    if updated.location != value {
                        patch.push(FieldPatch {
                            field: "location",
                            before: updated.location.clone(),
                            after: value.to_string(),
                        });
                        updated.location = value.to_string();
                    }
                }
            }
            "description" => {
                if let Some(value) = ctx.change.description.as_deref() {
                    if updated.description != value {
                        patch.push(FieldPatch {
                            field: "description",
                            before: updated.description.clone(),
                            after: value.to_string(),
                        });
                        updated.description = value.to_string();
                    }
                }
            }
            _ => {}
        }
    }

    if patch.is_empty() {
        ReconcileOutcome::NoEffect { blocked_fields }
    } else {
        ReconcileOutcome::Applied {
            event: updated,
            patch,
            blocked_fields,
        }
    }
}

/// Derive a category for an applied change: explicit field first, then a
/// keyword scan over the change text. The vocabulary is closed.
pub fn infer_category(event: &EventRecord, change: &PlannerChange) -> String {
    if let Some(explicit) = change.category.as_deref() {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let text = format!(
        "{} {} {}",
        change.summary.as_deref().unwrap_or(&event.summary),
        change.description.as_deref().unwrap_or(&event.description),
        change.reason.as_deref().unwrap_or(""),
    )
    .to_lowercase();

    const STUDY: [&str; 5] = ["class", "课程", "lecture", "school", "study"];
    const MEETING: [&str; 5] = ["meeting", "会议", "sync", "review", "standup"];
    const HEALTH: [&str; 5] = ["gym", "workout", "exercise", "健身", "跑步"];
    const TRAVEL: [&str; 5] = ["travel", "trip", "flight", "出行", "航班"];
    const FAMILY: [&str; 4] = ["family", "home", "家庭", "父母"];

    if STUDY.iter().any(|k| text.contains(k)) {
        "study".to_string()
    } else if MEETING.iter().any(|k| text.contains(k)) {
        "meeting".to_string()
    } else if HEALTH.iter().any(|k| text.contains(k)) {
        "health".to_string()
    } else if TRAVEL.iter().any(|k| text.contains(k)) {
        "travel".to_string()
    } else if FAMILY.iter().any(|k| text.contains(k)) {
        "family".to_string()
    } else {
        "general".to_string()
    }
}
