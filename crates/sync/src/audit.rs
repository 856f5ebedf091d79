//! Audit action vocabulary and metadata keys
//!
//! The set is closed: the admin surface and the undo/revise endpoints key
//! off these strings, so new outcomes get a new constant here.

use avocado_core::models::ManagedRole;

// Ingestion and hygiene
pub const SEED_OR_NORMALIZE_AI_TASK: &str = "seed_or_normalize_ai_task";
pub const SEED_USER_EVENT: &str = "seed_user_event";
pub const IMPORT_INTAKE_EVENT: &str = "import_intake_event";
pub const MIGRATE_LEGACY_USER_UID: &str = "migrate_legacy_user_uid";
pub const MIGRATE_NESTED_USER_UID: &str = "migrate_nested_user_uid";
pub const PROPAGATE_USER_INTENT: &str = "propagate_user_intent";
pub const PURGE_NESTED_STAGE_UID: &str = "purge_nested_stage_uid";
pub const PURGE_NESTED_USER_UID: &str = "purge_nested_user_uid";
pub const PURGE_NESTED_INTAKE_UID: &str = "purge_nested_intake_uid";
pub const PURGE_INVALID_NESTED_USER_UID: &str = "purge_invalid_nested_user_uid";
pub const DEDUPE_STAGE_UID: &str = "dedupe_stage_uid";
pub const DEDUPE_USER_UID: &str = "dedupe_user_uid";
pub const DEDUPE_INTAKE_UID: &str = "dedupe_intake_uid";

// Planner gateway
pub const AI_PLANNING_REQUEST: &str = "ai_planning_request";
pub const AI_PLANNING_RESPONSE: &str = "ai_planning_response";
pub const SKIP_AI_SAME_PAYLOAD: &str = "skip_ai_same_payload";

// Reconciler outcomes (conflict reasons come from `ConflictReason::as_str`)
pub const APPLY_AI_CHANGE: &str = "apply_ai_change";
pub const AI_CHANGE_UNMATCHED: &str = "ai_change_unmatched";
pub const AI_CHANGE_SKIPPED_NO_INTENT: &str = "ai_change_skipped_no_intent";
pub const AI_CHANGE_SKIPPED_NO_EFFECT: &str = "ai_change_skipped_no_effect";
pub const AI_CHANGE_BLOCKED_BY_EDITABLE_FIELDS: &str = "ai_change_blocked_by_editable_fields";

// Stage mirror
pub const REPAIR_STAGE_DUPLICATE_UID: &str = "repair_stage_duplicate_uid";
pub const SKIP_STAGE_MIRROR_AFTER_DUPLICATE: &str = "skip_stage_mirror_after_duplicate";
pub const PURGE_STAGE_ORPHAN_UID: &str = "purge_stage_orphan_uid";

// Run boundary and admin surface
pub const RUN_ERROR: &str = "run_error";
pub const UNDO_AI_CHANGE: &str = "undo_ai_change";
pub const REVISE_AI_CHANGE: &str = "revise_ai_change";

// app_meta keys
pub const META_KNOWN_MANAGED_CALENDAR_IDS: &str = "known_managed_calendar_ids";
pub const META_PLANNER_PAYLOAD_FINGERPRINT: &str = "planner_payload_fingerprint";

/// `purge_duplicate_<role>_calendar_event`
pub fn purge_duplicate_calendar_event_action(role: ManagedRole) -> String {
    format!("purge_duplicate_{}_calendar_event", role.as_str())
}

/// `warn_unverified_duplicate_<role>_calendar`
pub fn warn_unverified_duplicate_calendar_action(role: ManagedRole) -> String {
    format!("warn_unverified_duplicate_{}_calendar", role.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tagged_actions() {
        assert_eq!(
            purge_duplicate_calendar_event_action(ManagedRole::User),
            "purge_duplicate_user_calendar_event"
        );
        assert_eq!(
            warn_unverified_duplicate_calendar_action(ManagedRole::Staging),
            "warn_unverified_duplicate_staging_calendar"
        );
    }
}
