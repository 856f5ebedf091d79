//! Ingestion: stage hygiene, user-layer hygiene, intake import, and
//! source-calendar seeding
//!
//! Everything here runs before the planner is consulted; any mutation it
//! performs forces a replan.

use anyhow::Result;
use avocado_caldav::CalDavClient;
use avocado_core::config::TaskDefaultsConfig;
use avocado_core::models::{CalendarInfo, CalendarRole, EventSource, normalize_calendar_id,
    parse_iso_datetime};
use avocado_core::task_block::{
    TaskBlock, ensure_task_block, extract_user_intent, normalize_task_block, parse_task_block,
    set_user_intent, upsert_task_block,
};
use avocado_core::{collapse_nested_uid, prefix_depth, staged_uid};
use serde_json::json;
use tracing::{debug, warn};

use crate::audit;
use crate::engine::{RunContext, SyncEngine};

impl SyncEngine {
    /// Drop stage entries with nested UIDs or duplicate UIDs before the
    /// stage map becomes the diff baseline.
    pub(crate) async fn stage_hygiene(&self, ctx: &mut RunContext) -> Result<()> {
        let stage_cal = ctx.managed.stage.calendar_id.clone();
        let events = ctx
            .client
            .fetch_events(&stage_cal, ctx.window_start, ctx.window_end)
            .await?;
        for event in events {
            if event.uid.is_empty() {
                continue;
            }
            if prefix_depth(&event.uid) >= 2 {
                ctx.client
                    .delete_event(&stage_cal, &event.uid, &event.href)
                    .await?;
                self.audit(
                    ctx.run_id,
                    &stage_cal,
                    &event.uid,
                    audit::PURGE_NESTED_STAGE_UID,
                    json!({ "trigger": ctx.trigger.as_str() }),
                )
                .await?;
                ctx.should_replan = true;
                continue;
            }
            if ctx.stage_map.contains_key(&event.uid) {
                ctx.client
                    .delete_event(&stage_cal, "", &event.href)
                    .await?;
                self.audit(
                    ctx.run_id,
                    &stage_cal,
                    &event.uid,
                    audit::DEDUPE_STAGE_UID,
                    json!({ "trigger": ctx.trigger.as_str(), "href": event.href }),
                )
                .await?;
                ctx.should_replan = true;
                continue;
            }
            ctx.stage_map.insert(event.uid.clone(), event);
        }
        Ok(())
    }

    /// Collapse nested user UIDs left by earlier releases and deduplicate
    /// the working set.
    pub(crate) async fn user_hygiene(&self, ctx: &mut RunContext) -> Result<()> {
        let user_cal = ctx.managed.user.calendar_id.clone();
        let events = ctx
            .client
            .fetch_events(&user_cal, ctx.window_start, ctx.window_end)
            .await?;
        let fetched_uids: std::collections::BTreeSet<String> =
            events.iter().map(|e| e.uid.clone()).collect();

        for event in events {
            if event.uid.is_empty() {
                continue;
            }
            if prefix_depth(&event.uid) >= 2 {
                let collapsed = collapse_nested_uid(&event.uid);
                let twin_exists = collapsed != event.uid
                    && (fetched_uids.contains(&collapsed)
                        || ctx.user_map.contains_key(&collapsed));
                if twin_exists {
                    ctx.client
                        .delete_event(&user_cal, &event.uid, &event.href)
                        .await?;
                    self.audit(
                        ctx.run_id,
                        &user_cal,
                        &event.uid,
                        audit::PURGE_NESTED_USER_UID,
                        json!({
                            "trigger": ctx.trigger.as_str(),
                            "collapsed_uid": collapsed,
                        }),
                    )
                    .await?;
                    ctx.should_replan = true;
                    continue;
                }

                // No collapsed twin: migrate this entry in place.
                let mut migrated = event.clone();
                migrated.uid = collapsed.clone();
                migrated.href = String::new();
                migrated.etag = String::new();
                match ctx.client.upsert_event(&user_cal, &migrated).await {
                    Ok(saved) => {
                        ctx.client
                            .delete_event(&user_cal, &event.uid, &event.href)
                            .await?;
                        self.audit(
                            ctx.run_id,
                            &user_cal,
                            &event.uid,
                            audit::MIGRATE_NESTED_USER_UID,
                            json!({
                                "trigger": ctx.trigger.as_str(),
                                "collapsed_uid": collapsed,
                            }),
                        )
                        .await?;
                        ctx.user_map.insert(collapsed, saved);
                        ctx.should_replan = true;
                    }
                    Err(e) if e.is_duplicate_uid() => {
                        ctx.client
                            .delete_event(&user_cal, &event.uid, &event.href)
                            .await?;
                        self.audit(
                            ctx.run_id,
                            &user_cal,
                            &event.uid,
                            audit::PURGE_INVALID_NESTED_USER_UID,
                            json!({
                                "trigger": ctx.trigger.as_str(),
                                "collapsed_uid": collapsed,
                                "error": e.to_string(),
                            }),
                        )
                        .await?;
                        ctx.should_replan = true;
                    }
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            if ctx.user_map.contains_key(&event.uid) {
                ctx.client
                    .delete_event(&user_cal, "", &event.href)
                    .await?;
                self.audit(
                    ctx.run_id,
                    &user_cal,
                    &event.uid,
                    audit::DEDUPE_USER_UID,
                    json!({ "trigger": ctx.trigger.as_str(), "href": event.href }),
                )
                .await?;
                ctx.should_replan = true;
                continue;
            }
            ctx.user_map.insert(event.uid.clone(), event);
        }
        Ok(())
    }

    /// Import raw user creations from the intake calendar into the user
    /// layer under namespaced UIDs, then drain the intake.
    pub(crate) async fn intake_import(&self, ctx: &mut RunContext) -> Result<()> {
        let intake_cal = ctx.managed.intake.calendar_id.clone();
        let user_cal = ctx.managed.user.calendar_id.clone();
        let defaults = ctx.config.task_defaults.clone();
        let events = ctx
            .client
            .fetch_events(&intake_cal, ctx.window_start, ctx.window_end)
            .await?;

        for event in events {
            if event.uid.is_empty() {
                continue;
            }
            // Intake must contain only raw user creations; anything already
            // carrying a managed prefix is a stray write.
            if prefix_depth(&event.uid) >= 1 {
                ctx.client
                    .delete_event(&intake_cal, &event.uid, &event.href)
                    .await?;
                self.audit(
                    ctx.run_id,
                    &intake_cal,
                    &event.uid,
                    audit::PURGE_NESTED_INTAKE_UID,
                    json!({ "trigger": ctx.trigger.as_str() }),
                )
                .await?;
                ctx.should_replan = true;
                continue;
            }

            let target = staged_uid(&intake_cal, &event.uid);
            if ctx.user_map.contains_key(&target) {
                ctx.client
                    .delete_event(&intake_cal, &event.uid, &event.href)
                    .await?;
                self.audit(
                    ctx.run_id,
                    &intake_cal,
                    &event.uid,
                    audit::DEDUPE_INTAKE_UID,
                    json!({ "trigger": ctx.trigger.as_str(), "target_uid": target }),
                )
                .await?;
                ctx.should_replan = true;
                continue;
            }

            let mut twin = event.clone();
            twin.calendar_id = user_cal.clone();
            twin.uid = target.clone();
            twin.source = EventSource::User;
            twin.original_calendar_id = intake_cal.clone();
            twin.original_uid = event.uid.clone();
            twin.href = String::new();
            twin.etag = String::new();
            let (description, _, _) = ensure_task_block(&twin.description, &defaults);
            twin.description = description;

            match ctx.client.upsert_event(&user_cal, &twin).await {
                Ok(saved) => {
                    ctx.client
                        .delete_event(&intake_cal, &event.uid, &event.href)
                        .await?;
                    self.audit(
                        ctx.run_id,
                        &user_cal,
                        &target,
                        audit::IMPORT_INTAKE_EVENT,
                        json!({
                            "trigger": ctx.trigger.as_str(),
                            "original_calendar_id": intake_cal,
                            "original_uid": event.uid,
                        }),
                    )
                    .await?;
                    ctx.user_map.insert(target, saved);
                    ctx.should_replan = true;
                }
                Err(e) if e.is_duplicate_uid() => {
                    // A twin exists that the fetch did not surface; keep it.
                    ctx.client
                        .delete_event(&intake_cal, &event.uid, &event.href)
                        .await?;
                    self.audit(
                        ctx.run_id,
                        &intake_cal,
                        &event.uid,
                        audit::DEDUPE_INTAKE_UID,
                        json!({
                            "trigger": ctx.trigger.as_str(),
                            "target_uid": target,
                            "error": e.to_string(),
                        }),
                    )
                    .await?;
                    if let Some(existing) =
                        ctx.client.get_event_by_uid(&user_cal, &target).await?
                    {
                        ctx.user_map.insert(target, existing);
                    }
                    ctx.should_replan = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Walk every classified calendar and ingest the two source roles.
    pub(crate) async fn process_source_calendars(
        &self,
        ctx: &mut RunContext,
        classified: &[(CalendarInfo, CalendarRole)],
    ) -> Result<()> {
        for (calendar, role) in classified {
            match role {
                CalendarRole::Immutable => self.ingest_immutable(ctx, calendar).await?,
                CalendarRole::EditableSource => {
                    self.ingest_editable_source(ctx, calendar).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn source_defaults(&self, ctx: &RunContext, calendar_id: &str, immutable: bool) -> TaskDefaultsConfig {
        let behavior = ctx
            .config
            .calendar_rules
            .per_calendar_defaults
            .get(&normalize_calendar_id(calendar_id));
        let fallback_locked = if immutable { true } else { ctx.config.task_defaults.locked };
        let fallback_mandatory = if immutable { true } else { ctx.config.task_defaults.mandatory };
        TaskDefaultsConfig {
            locked: behavior.map(|b| b.locked).unwrap_or(fallback_locked),
            mandatory: behavior.map(|b| b.mandatory).unwrap_or(fallback_mandatory),
            editable_fields: ctx.config.task_defaults.editable_fields.clone(),
        }
    }

    /// Immutable sources are read-only planner constraints. Their task
    /// blocks are normalized in memory only and forced to locked+mandatory;
    /// nothing is ever written back.
    async fn ingest_immutable(&self, ctx: &mut RunContext, calendar: &CalendarInfo) -> Result<()> {
        let defaults = self.source_defaults(ctx, &calendar.calendar_id, true);
        let events = ctx
            .client
            .fetch_events(&calendar.calendar_id, ctx.window_start, ctx.window_end)
            .await?;
        debug!(calendar_id = %calendar.calendar_id, count = events.len(), "immutable source");
        for mut event in events {
            if event.uid.is_empty() {
                continue;
            }
            let (description, mut block, _) = ensure_task_block(&event.description, &defaults);
            event.description = description;
            if !block.locked || !block.mandatory {
                block.locked = true;
                block.mandatory = true;
                event.description = upsert_task_block(&event.description, &block);
            }
            event.locked = true;
            event.mandatory = true;
            self.snapshot_event(&event).await?;
            ctx.all_events.push(event);
        }
        Ok(())
    }

    /// Editable sources seed (or migrate) a user-layer twin per event and
    /// propagate fresher user intent into the twin.
    async fn ingest_editable_source(
        &self,
        ctx: &mut RunContext,
        calendar: &CalendarInfo,
    ) -> Result<()> {
        let source_cal = calendar.calendar_id.clone();
        let user_cal = ctx.managed.user.calendar_id.clone();
        let defaults = self.source_defaults(ctx, &source_cal, false);
        let events = ctx
            .client
            .fetch_events(&source_cal, ctx.window_start, ctx.window_end)
            .await?;

        for mut event in events {
            if event.uid.is_empty() {
                continue;
            }
            let (description, source_block, changed) =
                ensure_task_block(&event.description, &defaults);
            event.description = description;
            event.locked = source_block.locked;
            event.mandatory = source_block.mandatory;
            if changed {
                event = ctx.client.upsert_event(&source_cal, &event).await?;
                event.locked = source_block.locked;
                event.mandatory = source_block.mandatory;
                self.audit(
                    ctx.run_id,
                    &source_cal,
                    &event.uid,
                    audit::SEED_OR_NORMALIZE_AI_TASK,
                    json!({ "trigger": ctx.trigger.as_str(), "layer": "source" }),
                )
                .await?;
                ctx.should_replan = true;
            }

            let target = staged_uid(&source_cal, &event.uid);
            let has_legacy_twin =
                event.uid != target && ctx.user_map.contains_key(&event.uid);

            if has_legacy_twin {
                if ctx.user_map.contains_key(&target) {
                    // Both the legacy and the namespaced twin exist; the
                    // legacy copy is redundant.
                    if let Some(legacy) = ctx.user_map.remove(&event.uid) {
                        ctx.client
                            .delete_event(&user_cal, &legacy.uid, &legacy.href)
                            .await?;
                        self.audit(
                            ctx.run_id,
                            &user_cal,
                            &legacy.uid,
                            audit::DEDUPE_USER_UID,
                            json!({
                                "trigger": ctx.trigger.as_str(),
                                "target_uid": target,
                            }),
                        )
                        .await?;
                        ctx.should_replan = true;
                    }
                } else if let Some(legacy) = ctx.user_map.remove(&event.uid) {
                    let mut migrated = legacy.clone();
                    migrated.uid = target.clone();
                    migrated.href = String::new();
                    migrated.etag = String::new();
                    migrated.original_calendar_id = source_cal.clone();
                    migrated.original_uid = event.uid.clone();
                    let saved = ctx.client.upsert_event(&user_cal, &migrated).await?;
                    ctx.client
                        .delete_event(&user_cal, &legacy.uid, &legacy.href)
                        .await?;
                    self.audit(
                        ctx.run_id,
                        &user_cal,
                        &legacy.uid,
                        audit::MIGRATE_LEGACY_USER_UID,
                        json!({
                            "trigger": ctx.trigger.as_str(),
                            "target_uid": target,
                        }),
                    )
                    .await?;
                    ctx.user_map.insert(target.clone(), saved);
                    ctx.should_replan = true;
                }
            } else if !ctx.user_map.contains_key(&target) {
                let mut twin = event.clone();
                twin.calendar_id = user_cal.clone();
                twin.uid = target.clone();
                twin.source = EventSource::User;
                twin.original_calendar_id = source_cal.clone();
                twin.original_uid = event.uid.clone();
                twin.href = String::new();
                twin.etag = String::new();
                match ctx.client.upsert_event(&user_cal, &twin).await {
                    Ok(saved) => {
                        self.audit(
                            ctx.run_id,
                            &user_cal,
                            &target,
                            audit::SEED_USER_EVENT,
                            json!({
                                "trigger": ctx.trigger.as_str(),
                                "original_calendar_id": source_cal,
                                "original_uid": event.uid,
                            }),
                        )
                        .await?;
                        ctx.user_map.insert(target.clone(), saved);
                        ctx.should_replan = true;
                    }
                    Err(e) if e.is_duplicate_uid() => {
                        warn!(uid = %target, "seed raced an existing twin, keeping it");
                        if let Some(existing) =
                            ctx.client.get_event_by_uid(&user_cal, &target).await?
                        {
                            ctx.user_map.insert(target.clone(), existing);
                        }
                        ctx.should_replan = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            self.propagate_intent(ctx, &source_block, &event.description, &target, &defaults)
                .await?;
            self.snapshot_event(&event).await?;
        }
        Ok(())
    }

    /// Copy a fresher user intent from the source event into the user twin.
    async fn propagate_intent(
        &self,
        ctx: &mut RunContext,
        source_block: &TaskBlock,
        source_description: &str,
        target_uid: &str,
        defaults: &TaskDefaultsConfig,
    ) -> Result<()> {
        let source_intent = extract_user_intent(source_description);
        if source_intent.is_empty() {
            return Ok(());
        }
        let Some(twin) = ctx.user_map.get(target_uid).cloned() else {
            return Ok(());
        };
        let twin_block = match parse_task_block(&twin.description) {
            Some(parsed) => normalize_task_block(&parsed, defaults),
            None => TaskBlock::from_defaults(defaults),
        };
        if twin_block.user_intent.trim() == source_intent {
            return Ok(());
        }
        let source_is_newer = if twin_block.user_intent.trim().is_empty() {
            true
        } else {
            match (
                parse_iso_datetime(&source_block.updated_at),
                parse_iso_datetime(&twin_block.updated_at),
            ) {
                (Ok(source_ts), Ok(twin_ts)) => source_ts > twin_ts,
                _ => false,
            }
        };
        if !source_is_newer {
            return Ok(());
        }

        let user_cal = ctx.managed.user.calendar_id.clone();
        let (description, _, changed) =
            set_user_intent(&twin.description, defaults, &source_intent);
        if changed {
            let mut updated = twin;
            updated.description = description;
            let saved = ctx.client.upsert_event(&user_cal, &updated).await?;
            self.audit(
                ctx.run_id,
                &user_cal,
                target_uid,
                audit::PROPAGATE_USER_INTENT,
                json!({
                    "trigger": ctx.trigger.as_str(),
                    "user_intent": source_intent,
                }),
            )
            .await?;
            ctx.user_map.insert(target_uid.to_string(), saved);
            ctx.should_replan = true;
        }
        Ok(())
    }

    /// Final user-layer pass: guarantee a valid task block on every event,
    /// refresh lock flags, take the baseline etag snapshot, and run the
    /// stage-diff replan gate.
    pub(crate) async fn normalize_user_layer(&self, ctx: &mut RunContext) -> Result<()> {
        let user_cal = ctx.managed.user.calendar_id.clone();
        let defaults = ctx.config.task_defaults.clone();
        let uids: Vec<String> = ctx.user_map.keys().cloned().collect();

        for uid in uids {
            let Some(mut event) = ctx.user_map.get(&uid).cloned() else {
                continue;
            };
            let (description, block, changed) = ensure_task_block(&event.description, &defaults);
            if changed {
                event.description = description;
                event = ctx.client.upsert_event(&user_cal, &event).await?;
                self.audit(
                    ctx.run_id,
                    &user_cal,
                    &uid,
                    audit::SEED_OR_NORMALIZE_AI_TASK,
                    json!({ "trigger": ctx.trigger.as_str(), "layer": "user" }),
                )
                .await?;
                ctx.should_replan = true;
            }
            event.locked = block.locked;
            event.mandatory = block.mandatory;
            event.source = EventSource::User;

            if Self::stage_twin_differs(ctx, &event) {
                ctx.should_replan = true;
            }
            ctx.baseline_etags.insert(uid.clone(), event.etag.clone());
            self.snapshot_event(&event).await?;
            ctx.all_events.push(event.clone());
            ctx.user_map.insert(uid, event);
        }
        Ok(())
    }
}
