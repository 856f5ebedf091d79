//! Run orchestrator
//!
//! `run_once` is the whole reconciliation pass. It is single-threaded by
//! design: the scheduler never overlaps runs, and every CalDAV write inside
//! a run updates the in-memory view before the next step looks at it.

use anyhow::{Context, Result};
use avocado_ai::{PlannerClient, PlannerConnector};
use avocado_caldav::{CalDavClient, CalDavConnector};
use avocado_core::config::AppConfig;
use avocado_core::models::{
    CalendarRole, EventRecord, EventSource, SyncOutcome, SyncStatus, Trigger, planning_window,
};
use avocado_core::planner::{
    PlannerChange, build_messages, build_planning_payload, normalize_changes, payload_fingerprint,
};
use avocado_core::reconciler::{ApplyContext, ReconcileOutcome, apply_change, infer_category};
use avocado_core::task_block::{
    has_user_intent, normalize_task_block, parse_task_block, set_task_category, set_user_intent,
};
use avocado_core::{event_fingerprint, snapshot_payload_hash, staged_uid};
use avocado_store::{ConfigStore, StateStore};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::audit;
use crate::layers::{ManagedCalendars, classify_calendars, immutable_calendar_ids};

const ERROR_CHAIN_LIMIT: usize = 5;
const ERROR_TEXT_LIMIT: usize = 2000;
const RESPONSE_PREVIEW_LIMIT: usize = 10;

/// Counters that survive a failed run so partial work is still reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub changes_applied: i64,
    pub conflicts: i64,
}

/// Everything one run carries between phases.
pub(crate) struct RunContext {
    pub run_id: i64,
    pub trigger: Trigger,
    pub config: AppConfig,
    pub client: Arc<dyn CalDavClient>,
    pub managed: ManagedCalendars,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Stage events by UID after hygiene.
    pub stage_map: BTreeMap<String, EventRecord>,
    /// User-layer working set by UID.
    pub user_map: BTreeMap<String, EventRecord>,
    /// Etag snapshot per user UID, taken after ingestion.
    pub baseline_etags: BTreeMap<String, String>,
    /// Planner payload events: immutable sources plus the user layer.
    pub all_events: Vec<EventRecord>,
    pub immutable_ids: BTreeSet<String>,
    pub should_replan: bool,
}

/// The reconciliation engine: owns the stores and the service connectors,
/// and is driven one run at a time.
pub struct SyncEngine {
    config_store: Arc<ConfigStore>,
    state: StateStore,
    caldav: Arc<dyn CalDavConnector>,
    planner: Arc<dyn PlannerConnector>,
}

fn bounded_error_text(error: &anyhow::Error) -> String {
    let mut text = String::new();
    for (index, cause) in error.chain().take(ERROR_CHAIN_LIMIT).enumerate() {
        if index > 0 {
            text.push_str("\ncaused by: ");
        }
        text.push_str(&cause.to_string());
    }
    if text.len() > ERROR_TEXT_LIMIT {
        let mut cut = ERROR_TEXT_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

impl SyncEngine {
    pub fn new(
        config_store: Arc<ConfigStore>,
        state: StateStore,
        caldav: Arc<dyn CalDavConnector>,
        planner: Arc<dyn PlannerConnector>,
    ) -> Self {
        SyncEngine {
            config_store,
            state,
            caldav,
            planner,
        }
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config_store
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn caldav(&self) -> &Arc<dyn CalDavConnector> {
        &self.caldav
    }

    pub fn planner(&self) -> &Arc<dyn PlannerConnector> {
        &self.planner
    }

    pub(crate) async fn audit(
        &self,
        run_id: i64,
        calendar_id: &str,
        uid: &str,
        action: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        self.state
            .record_audit_event(Some(run_id), calendar_id, uid, action, &details)
            .await
            .context("recording audit event")?;
        Ok(())
    }

    /// One full reconciliation pass.
    pub async fn run_once(
        &self,
        trigger: Trigger,
        window_override: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> SyncOutcome {
        let run_at = Utc::now();
        let started = Instant::now();
        let mut stats = RunStats::default();

        let run_id = match self.state.start_run(trigger).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "could not open run row");
                return SyncOutcome {
                    status: SyncStatus::Error,
                    message: format!("state store unavailable: {e}"),
                    duration_ms: started.elapsed().as_millis() as i64,
                    changes_applied: 0,
                    conflicts: 0,
                    trigger,
                    run_at,
                };
            }
        };

        let result = self
            .execute(run_id, trigger, window_override, &mut stats)
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, message) = match result {
            Ok((status, message)) => (status, message),
            Err(error) => {
                let text = bounded_error_text(&error);
                error!(run_id, error = %text, "run failed");
                let _ = self
                    .audit(
                        run_id,
                        "system",
                        "sync",
                        audit::RUN_ERROR,
                        json!({
                            "trigger": trigger.as_str(),
                            "error": error.to_string(),
                            "traceback": text,
                        }),
                    )
                    .await;
                (SyncStatus::Error, error.to_string())
            }
        };

        if let Err(e) = self
            .state
            .finish_run(
                run_id,
                status,
                &message,
                duration_ms,
                stats.changes_applied,
                stats.conflicts,
            )
            .await
        {
            error!(run_id, error = %e, "could not finalize run row");
        }

        info!(
            run_id,
            trigger = trigger.as_str(),
            status = status.as_str(),
            duration_ms,
            changes_applied = stats.changes_applied,
            conflicts = stats.conflicts,
            "run finished"
        );

        SyncOutcome {
            status,
            message: format!("{message} run_id={run_id}"),
            duration_ms,
            changes_applied: stats.changes_applied,
            conflicts: stats.conflicts,
            trigger,
            run_at,
        }
    }

    async fn execute(
        &self,
        run_id: i64,
        trigger: Trigger,
        window_override: Option<(DateTime<Utc>, DateTime<Utc>)>,
        stats: &mut RunStats,
    ) -> Result<(SyncStatus, String)> {
        let config = self.config_store.load().context("loading configuration")?;
        if !config.caldav.is_complete() {
            return Ok((
                SyncStatus::Skipped,
                "CalDAV config missing base_url/username. Sync skipped.".to_string(),
            ));
        }

        let client = self
            .caldav
            .connect(&config.caldav)
            .context("connecting to CalDAV")?;
        let planner = self.planner.connect(&config.ai);

        let calendars = client
            .list_calendars()
            .await
            .context("listing calendars")?;

        let (managed, config) = self
            .ensure_managed_calendars(&client, config)
            .await
            .context("ensuring managed calendars")?;

        let known_ids = self.load_known_managed_ids().await?;
        self.store_known_managed_ids(&known_ids, &managed).await?;

        let classified = classify_calendars(&config, &calendars, &managed);
        let immutable_ids = immutable_calendar_ids(&config, &calendars);

        let (window_start, window_end) = match window_override {
            Some(window) => window,
            None => planning_window(Utc::now(), config.sync.window_days),
        };

        let mut ctx = RunContext {
            run_id,
            trigger,
            config,
            client,
            managed,
            window_start,
            window_end,
            stage_map: BTreeMap::new(),
            user_map: BTreeMap::new(),
            baseline_etags: BTreeMap::new(),
            all_events: Vec::new(),
            immutable_ids,
            should_replan: matches!(trigger, Trigger::Manual | Trigger::Startup),
        };

        self.purge_duplicate_calendars(&mut ctx, &classified, &known_ids)
            .await?;

        self.stage_hygiene(&mut ctx).await?;
        self.user_hygiene(&mut ctx).await?;
        self.intake_import(&mut ctx).await?;
        self.process_source_calendars(&mut ctx, &classified).await?;
        self.normalize_user_layer(&mut ctx).await?;

        // Stage UIDs with no user twin force a replan; the mirror phase
        // prunes them afterwards.
        for stage_uid in ctx.stage_map.keys() {
            if !ctx.user_map.contains_key(stage_uid) {
                ctx.should_replan = true;
                break;
            }
        }

        let changes = self.plan(&mut ctx, planner.as_ref()).await?;
        self.reconcile(&mut ctx, &changes, stats).await?;
        self.mirror_stage(&mut ctx).await?;

        let message = format!(
            "Processed {} events, {} AI changes.",
            ctx.all_events.len(),
            changes.len()
        );
        Ok((SyncStatus::Success, message))
    }

    /// Resolve (or create) the three managed calendars and persist any id
    /// changes back to configuration.
    async fn ensure_managed_calendars(
        &self,
        client: &Arc<dyn CalDavClient>,
        config: AppConfig,
    ) -> Result<(ManagedCalendars, AppConfig)> {
        let rules = &config.calendar_rules;
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
            patch.insert(
                "staging_calendar_id".to_string(),
                json!(stage.calendar_id),
            );
        }
        if user.calendar_id != rules.user_calendar_id {
            patch.insert("user_calendar_id".to_string(), json!(user.calendar_id));
        }
        if intake.calendar_id != rules.intake_calendar_id {
            patch.insert("intake_calendar_id".to_string(), json!(intake.calendar_id));
        }

        let config = if patch.is_empty() {
            config
        } else {
            self.config_store
                .update(&json!({ "calendar_rules": patch }))
                .context("persisting managed calendar ids")?
        };

        Ok((ManagedCalendars { stage, user, intake }, config))
    }

    async fn load_known_managed_ids(&self) -> Result<BTreeSet<String>> {
        let raw = self
            .state
            .get_meta(audit::META_KNOWN_MANAGED_CALENDAR_IDS)
            .await?;
        let Some(raw) = raw else {
            return Ok(BTreeSet::new());
        };
        let ids: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
        Ok(ids.into_iter().collect())
    }

    async fn store_known_managed_ids(
        &self,
        known: &BTreeSet<String>,
        managed: &ManagedCalendars,
    ) -> Result<()> {
        let mut merged = known.clone();
        for id in managed.ids() {
            merged.insert(id.to_string());
        }
        if merged != *known {
            let rendered = serde_json::to_string(&merged.iter().collect::<Vec<_>>())
                .unwrap_or_else(|_| "[]".to_string());
            self.state
                .set_meta(audit::META_KNOWN_MANAGED_CALENDAR_IDS, &rendered)
                .await?;
        }
        Ok(())
    }

    /// Drain calendars that collide with a managed name, but only when the
    /// duplicate id is already in the known-managed set: a same-named
    /// calendar this system never created is the user's, and only gets a
    /// warning.
    async fn purge_duplicate_calendars(
        &self,
        ctx: &mut RunContext,
        classified: &[(avocado_core::models::CalendarInfo, CalendarRole)],
        known_ids: &BTreeSet<String>,
    ) -> Result<()> {
        for (calendar, role) in classified {
            let CalendarRole::ManagedDuplicate(managed_role) = role else {
                continue;
            };
            if !known_ids.contains(&calendar.calendar_id) {
                warn!(
                    calendar_id = %calendar.calendar_id,
                    name = %calendar.name,
                    "same-named calendar is not known-managed, leaving untouched"
                );
                self.audit(
                    ctx.run_id,
                    &calendar.calendar_id,
                    "",
                    &audit::warn_unverified_duplicate_calendar_action(*managed_role),
                    json!({
                        "trigger": ctx.trigger.as_str(),
                        "name": calendar.name,
                    }),
                )
                .await?;
                continue;
            }

            let events = ctx
                .client
                .fetch_events(&calendar.calendar_id, ctx.window_start, ctx.window_end)
                .await?;
            let mut purged_any = false;
            for event in events {
                if ctx
                    .client
                    .delete_event(&calendar.calendar_id, &event.uid, &event.href)
                    .await?
                {
                    purged_any = true;
                    self.audit(
                        ctx.run_id,
                        &calendar.calendar_id,
                        &event.uid,
                        &audit::purge_duplicate_calendar_event_action(*managed_role),
                        json!({
                            "trigger": ctx.trigger.as_str(),
                            "href": event.href,
                            "name": calendar.name,
                        }),
                    )
                    .await?;
                }
            }
            if purged_any {
                ctx.should_replan = true;
            }
        }
        Ok(())
    }

    /// Planner gateway: assemble the payload, gate scheduled calls on the
    /// payload fingerprint, call out, and normalize the answer.
    async fn plan(
        &self,
        ctx: &mut RunContext,
        planner: &dyn PlannerClient,
    ) -> Result<Vec<PlannerChange>> {
        if !planner.is_configured() || !ctx.should_replan {
            return Ok(Vec::new());
        }

        let payload = build_planning_payload(
            ctx.all_events.clone(),
            ctx.immutable_ids.iter().cloned().collect(),
            ctx.window_start.to_rfc3339(),
            ctx.window_end.to_rfc3339(),
            ctx.config.sync.timezone.clone(),
        );
        let fingerprint = payload_fingerprint(&payload);

        if ctx.trigger == Trigger::Scheduled {
            let last = self
                .state
                .get_meta(audit::META_PLANNER_PAYLOAD_FINGERPRINT)
                .await?;
            if last.as_deref() == Some(fingerprint.as_str()) {
                info!(run_id = ctx.run_id, "planner payload unchanged, suppressing call");
                self.audit(
                    ctx.run_id,
                    "system",
                    "sync",
                    audit::SKIP_AI_SAME_PAYLOAD,
                    json!({
                        "trigger": ctx.trigger.as_str(),
                        "fingerprint": fingerprint,
                    }),
                )
                .await?;
                return Ok(Vec::new());
            }
        }

        let messages = build_messages(&payload, &ctx.config.ai.system_prompt);
        let request_bytes = messages
            .get(1)
            .map(|m| m.content.len())
            .unwrap_or_default();
        self.audit(
            ctx.run_id,
            "system",
            "sync",
            audit::AI_PLANNING_REQUEST,
            json!({
                "trigger": ctx.trigger.as_str(),
                "request_bytes": request_bytes,
                "event_count": ctx.all_events.len(),
            }),
        )
        .await?;

        let response = planner
            .generate(&messages)
            .await
            .context("calling planner")?;

        self.state
            .set_meta(audit::META_PLANNER_PAYLOAD_FINGERPRINT, &fingerprint)
            .await?;

        let preview: Vec<serde_json::Value> = response
            .changes
            .iter()
            .take(RESPONSE_PREVIEW_LIMIT)
            .cloned()
            .collect();
        self.audit(
            ctx.run_id,
            "system",
            "sync",
            audit::AI_PLANNING_RESPONSE,
            json!({
                "trigger": ctx.trigger.as_str(),
                "change_count": response.changes.len(),
                "preview": preview,
            }),
        )
        .await?;

        Ok(normalize_changes(&response.changes))
    }

    /// Resolve a change to a user-layer UID: direct hit, then the staged
    /// form of a source address, then a unique bare-UID match.
    fn resolve_change_target(&self, ctx: &RunContext, change: &PlannerChange) -> Option<String> {
        let user_cal = &ctx.managed.user.calendar_id;
        if &change.calendar_id == user_cal && ctx.user_map.contains_key(&change.uid) {
            return Some(change.uid.clone());
        }
        let staged = staged_uid(&change.calendar_id, &change.uid);
        if ctx.user_map.contains_key(&staged) {
            return Some(staged);
        }
        if ctx.user_map.contains_key(&change.uid) {
            return Some(change.uid.clone());
        }
        None
    }

    async fn reconcile(
        &self,
        ctx: &mut RunContext,
        changes: &[PlannerChange],
        stats: &mut RunStats,
    ) -> Result<()> {
        let user_cal = ctx.managed.user.calendar_id.clone();
        let defaults = ctx.config.task_defaults.clone();

        for change in changes {
            let Some(uid) = self.resolve_change_target(ctx, change) else {
                self.audit(
                    ctx.run_id,
                    &change.calendar_id,
                    &change.uid,
                    audit::AI_CHANGE_UNMATCHED,
                    json!({
                        "trigger": ctx.trigger.as_str(),
                        "reason": "no user-layer event matches this change",
                    }),
                )
                .await?;
                continue;
            };

            // Read the live event so edits racing the planner are caught by
            // the baseline etag, not silently overwritten.
            let mut current = match ctx.client.get_event_by_uid(&user_cal, &uid).await? {
                Some(live) => live,
                None => match ctx.user_map.get(&uid) {
                    Some(event) => event.clone(),
                    None => continue,
                },
            };
            current.source = EventSource::User;
            let block = match parse_task_block(&current.description) {
                Some(parsed) => normalize_task_block(&parsed, &defaults),
                None => avocado_core::task_block::TaskBlock::from_defaults(&defaults),
            };
            current.locked = block.locked;
            current.mandatory = block.mandatory;

            let baseline_etag = ctx
                .baseline_etags
                .get(&uid)
                .cloned()
                .unwrap_or_default();
            let apply_ctx = ApplyContext {
                change,
                baseline_etag: &baseline_etag,
                editable_fields: &block.editable_fields,
                has_user_intent: has_user_intent(&current.description),
            };

            match apply_change(&current, &apply_ctx) {
                ReconcileOutcome::Conflict { reason } => {
                    stats.conflicts += 1;
                    self.audit(
                        ctx.run_id,
                        &user_cal,
                        &uid,
                        reason.as_str(),
                        json!({
                            "trigger": ctx.trigger.as_str(),
                            "uid": uid,
                            "baseline_etag": baseline_etag,
                            "live_etag": current.etag,
                        }),
                    )
                    .await?;
                }
                ReconcileOutcome::SkippedNoIntent => {
                    self.audit(
                        ctx.run_id,
                        &user_cal,
                        &uid,
                        audit::AI_CHANGE_SKIPPED_NO_INTENT,
                        json!({ "trigger": ctx.trigger.as_str(), "uid": uid }),
                    )
                    .await?;
                }
                ReconcileOutcome::NoEffect { blocked_fields } => {
                    if !blocked_fields.is_empty() {
                        self.audit(
                            ctx.run_id,
                            &user_cal,
                            &uid,
                            audit::AI_CHANGE_BLOCKED_BY_EDITABLE_FIELDS,
                            json!({
                                "trigger": ctx.trigger.as_str(),
                                "blocked_fields": blocked_fields,
                            }),
                        )
                        .await?;
                    }
                    self.audit(
                        ctx.run_id,
                        &user_cal,
                        &uid,
                        audit::AI_CHANGE_SKIPPED_NO_EFFECT,
                        json!({ "trigger": ctx.trigger.as_str(), "uid": uid }),
                    )
                    .await?;
                    // Consume the intent anyway; a standing no-op intent
                    // would otherwise force a replan every cycle.
                    let (description, _, changed) =
                        set_user_intent(&current.description, &defaults, "");
                    if changed {
                        current.description = description;
                        let saved = ctx.client.upsert_event(&user_cal, &current).await?;
                        ctx.baseline_etags.insert(uid.clone(), saved.etag.clone());
                        ctx.user_map.insert(uid.clone(), saved);
                    }
                }
                ReconcileOutcome::Applied {
                    event: updated,
                    patch,
                    blocked_fields,
                } => {
                    if !blocked_fields.is_empty() {
                        self.audit(
                            ctx.run_id,
                            &user_cal,
                            &uid,
                            audit::AI_CHANGE_BLOCKED_BY_EDITABLE_FIELDS,
                            json!({
                                "trigger": ctx.trigger.as_str(),
                                "blocked_fields": blocked_fields,
                            }),
                        )
                        .await?;
                    }

                    let before = current.clone();
                    let mut saved = ctx.client.upsert_event(&user_cal, &updated).await?;

                    let category = infer_category(&saved, change);
                    let (with_category, _, category_changed) =
                        set_task_category(&saved.description, &defaults, &category);
                    let (final_description, _, intent_changed) =
                        set_user_intent(&with_category, &defaults, "");
                    if category_changed || intent_changed {
                        saved.description = final_description;
                        saved = ctx.client.upsert_event(&user_cal, &saved).await?;
                    }

                    stats.changes_applied += 1;
                    ctx.baseline_etags.insert(uid.clone(), saved.etag.clone());
                    ctx.user_map.insert(uid.clone(), saved.clone());

                    let mut fields: Vec<&'static str> = change.touched_fields();
                    fields.sort_unstable();
                    self.audit(
                        ctx.run_id,
                        &user_cal,
                        &uid,
                        audit::APPLY_AI_CHANGE,
                        json!({
                            "trigger": ctx.trigger.as_str(),
                            "category": category,
                            "fields": fields,
                            "blocked_fields": blocked_fields,
                            "patch": patch,
                            "reason": change.reason,
                            "title": saved.summary,
                            "before": before,
                            "after": saved,
                            "expected_etag": saved.etag,
                        }),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Mirror the post-apply user layer into the stage calendar, preserving
    /// UIDs, and prune stage entries with no user twin.
    async fn mirror_stage(&self, ctx: &mut RunContext) -> Result<()> {
        let stage_cal = ctx.managed.stage.calendar_id.clone();
        let user_cal = ctx.managed.user.calendar_id.clone();

        for (uid, user_event) in &ctx.user_map {
            let mut mirror = user_event.clone();
            mirror.calendar_id = stage_cal.clone();
            mirror.source = EventSource::Staging;
            mirror.original_calendar_id = user_cal.clone();
            mirror.original_uid = uid.clone();
            match ctx.stage_map.get(uid) {
                Some(existing) => {
                    mirror.href = existing.href.clone();
                    mirror.etag = existing.etag.clone();
                }
                None => {
                    mirror.href = String::new();
                    mirror.etag = String::new();
                }
            }

            match ctx.client.upsert_event(&stage_cal, &mirror).await {
                Ok(saved) => {
                    ctx.stage_map.insert(uid.clone(), saved);
                }
                Err(e) if e.is_duplicate_uid() => {
                    // One-shot repair: drop the conflicting entry and retry.
                    let _ = ctx.client.delete_event(&stage_cal, uid, "").await?;
                    let mut retry = mirror.clone();
                    retry.href = String::new();
                    retry.etag = String::new();
                    match ctx.client.upsert_event(&stage_cal, &retry).await {
                        Ok(saved) => {
                            self.audit(
                                ctx.run_id,
                                &stage_cal,
                                uid,
                                audit::REPAIR_STAGE_DUPLICATE_UID,
                                json!({ "trigger": ctx.trigger.as_str() }),
                            )
                            .await?;
                            ctx.stage_map.insert(uid.clone(), saved);
                        }
                        Err(retry_error) if retry_error.is_duplicate_uid() => {
                            warn!(uid = %uid, "stage mirror still duplicate after repair");
                            self.audit(
                                ctx.run_id,
                                &stage_cal,
                                uid,
                                audit::SKIP_STAGE_MIRROR_AFTER_DUPLICATE,
                                json!({
                                    "trigger": ctx.trigger.as_str(),
                                    "error": retry_error.to_string(),
                                }),
                            )
                            .await?;
                        }
                        Err(retry_error) => return Err(retry_error.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let orphans: Vec<String> = ctx
            .stage_map
            .keys()
            .filter(|uid| !ctx.user_map.contains_key(*uid))
            .cloned()
            .collect();
        for uid in orphans {
            let href = ctx
                .stage_map
                .get(&uid)
                .map(|e| e.href.clone())
                .unwrap_or_default();
            if ctx.client.delete_event(&stage_cal, &uid, &href).await? {
                self.audit(
                    ctx.run_id,
                    &stage_cal,
                    &uid,
                    audit::PURGE_STAGE_ORPHAN_UID,
                    json!({ "trigger": ctx.trigger.as_str() }),
                )
                .await?;
            }
            ctx.stage_map.remove(&uid);
        }

        Ok(())
    }

    /// Snapshot one event row for the audit surface.
    pub(crate) async fn snapshot_event(&self, event: &EventRecord) -> Result<()> {
        self.state
            .upsert_snapshot(
                &event.calendar_id,
                &event.uid,
                &event.etag,
                &snapshot_payload_hash(event),
            )
            .await?;
        Ok(())
    }

    /// Replan when the stage twin is missing or its content diverged.
    pub(crate) fn stage_twin_differs(ctx: &RunContext, event: &EventRecord) -> bool {
        match ctx.stage_map.get(&event.uid) {
            Some(stage_event) => event_fingerprint(stage_event) != event_fingerprint(event),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_error_text_truncates() {
        let error = anyhow::anyhow!("x".repeat(5000));
        let text = bounded_error_text(&error);
        assert!(text.len() <= ERROR_TEXT_LIMIT);
    }

    #[test]
    fn test_bounded_error_text_chains() {
        let root = anyhow::anyhow!("root cause");
        let wrapped = root.context("middle").context("outer");
        let text = bounded_error_text(&wrapped);
        assert!(text.contains("outer"));
        assert!(text.contains("caused by: root cause"));
    }
}
