//! In-memory fakes for the engine scenario tests

use async_trait::async_trait;
use avocado_ai::{PlannerClient, PlannerConnector, PlannerResponse};
use avocado_caldav::{CalDavClient, CalDavConnector, CalDavError};
use avocado_core::config::{AiConfig, CalDavConfig};
use avocado_core::models::{CalendarInfo, EventRecord};
use avocado_core::planner::ChatMessage;
use avocado_store::{ConfigStore, StateStore};
use avocado_sync::SyncEngine;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type GenerateHook = Box<dyn Fn() + Send + Sync>;

/// CalDAV fake: calendars and events held in maps, etags bumped on every
/// write like a real server would.
pub struct FakeCalDav {
    calendars: Mutex<Vec<CalendarInfo>>,
    events: Mutex<BTreeMap<String, BTreeMap<String, EventRecord>>>,
    pub upsert_log: Mutex<Vec<(String, String)>>,
    counter: AtomicU64,
    pub fail_listing: AtomicBool,
}

impl FakeCalDav {
    pub fn new() -> Self {
        FakeCalDav {
            calendars: Mutex::new(Vec::new()),
            events: Mutex::new(BTreeMap::new()),
            upsert_log: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            fail_listing: AtomicBool::new(false),
        }
    }

    fn next_etag(&self) -> String {
        format!("etag-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn add_calendar(&self, calendar_id: &str, name: &str) {
        self.calendars.lock().unwrap().push(CalendarInfo {
            calendar_id: calendar_id.to_string(),
            name: name.to_string(),
            url: calendar_id.to_string(),
        });
        self.events
            .lock()
            .unwrap()
            .entry(calendar_id.to_string())
            .or_default();
    }

    pub fn insert_event(&self, calendar_id: &str, mut event: EventRecord) {
        event.calendar_id = calendar_id.to_string();
        if event.etag.is_empty() {
            event.etag = self.next_etag();
        }
        if event.href.is_empty() {
            event.href = format!("{calendar_id}/{}.ics", event.uid);
        }
        self.events
            .lock()
            .unwrap()
            .entry(calendar_id.to_string())
            .or_default()
            .insert(event.uid.clone(), event);
    }

    pub fn event(&self, calendar_id: &str, uid: &str) -> Option<EventRecord> {
        self.events
            .lock()
            .unwrap()
            .get(calendar_id)
            .and_then(|m| m.get(uid))
            .cloned()
    }

    pub fn uids(&self, calendar_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .get(calendar_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate a user edit: bump the stored etag without the engine seeing
    /// it happen.
    pub fn touch_event(&self, calendar_id: &str, uid: &str) {
        let etag = self.next_etag();
        if let Some(event) = self
            .events
            .lock()
            .unwrap()
            .get_mut(calendar_id)
            .and_then(|m| m.get_mut(uid))
        {
            event.etag = format!("user-edit-{etag}");
        }
    }

    /// Replace a stored event's description (user edit in another client).
    pub fn rewrite_description(&self, calendar_id: &str, uid: &str, description: &str) {
        let etag = self.next_etag();
        if let Some(event) = self
            .events
            .lock()
            .unwrap()
            .get_mut(calendar_id)
            .and_then(|m| m.get_mut(uid))
        {
            event.description = description.to_string();
            event.etag = etag;
        }
    }

    pub fn upserts_to(&self, calendar_id: &str) -> Vec<String> {
        self.upsert_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(cal, _)| cal == calendar_id)
            .map(|(_, uid)| uid.clone())
            .collect()
    }
}

#[async_trait]
impl CalDavClient for FakeCalDav {
    async fn list_calendars(&self) -> Result<Vec<CalendarInfo>, CalDavError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(CalDavError::Status {
                status: 500,
                url: "https://dav.example.com/".to_string(),
                body: "listing exploded".to_string(),
            });
        }
        Ok(self.calendars.lock().unwrap().clone())
    }

    async fn ensure_calendar(
        &self,
        calendar_id: &str,
        calendar_name: &str,
    ) -> Result<CalendarInfo, CalDavError> {
        let calendars = self.calendars.lock().unwrap().clone();
        if let Some(found) = calendars.iter().find(|c| c.calendar_id == calendar_id) {
            return Ok(found.clone());
        }
        if let Some(found) = calendars.iter().find(|c| c.name == calendar_name) {
            return Ok(found.clone());
        }
        let created_id = format!("auto-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.add_calendar(&created_id, calendar_name);
        Ok(CalendarInfo {
            calendar_id: created_id.clone(),
            name: calendar_name.to_string(),
            url: created_id,
        })
    }

    async fn fetch_events(
        &self,
        calendar_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, CalDavError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(calendar_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_event(
        &self,
        calendar_id: &str,
        event: &EventRecord,
    ) -> Result<EventRecord, CalDavError> {
        let mut saved = event.clone();
        saved.calendar_id = calendar_id.to_string();
        saved.etag = self.next_etag();
        if saved.href.is_empty() {
            saved.href = format!("{calendar_id}/{}.ics", saved.uid);
        }
        self.events
            .lock()
            .unwrap()
            .entry(calendar_id.to_string())
            .or_default()
            .insert(saved.uid.clone(), saved.clone());
        self.upsert_log
            .lock()
            .unwrap()
            .push((calendar_id.to_string(), saved.uid.clone()));
        Ok(saved)
    }

    async fn delete_event(
        &self,
        calendar_id: &str,
        uid: &str,
        href: &str,
    ) -> Result<bool, CalDavError> {
        let mut events = self.events.lock().unwrap();
        let Some(calendar) = events.get_mut(calendar_id) else {
            return Ok(false);
        };
        if !uid.is_empty() {
            return Ok(calendar.remove(uid).is_some());
        }
        if !href.is_empty() {
            if let Some(found) = calendar
                .values()
                .find(|e| e.href == href)
                .map(|e| e.uid.clone())
            {
                return Ok(calendar.remove(&found).is_some());
            }
        }
        Ok(false)
    }

    async fn get_event_by_uid(
        &self,
        calendar_id: &str,
        uid: &str,
    ) -> Result<Option<EventRecord>, CalDavError> {
        Ok(self.event(calendar_id, uid))
    }
}

pub struct FakeCalDavConnector(pub Arc<FakeCalDav>);

impl CalDavConnector for FakeCalDavConnector {
    fn connect(&self, _config: &CalDavConfig) -> Result<Arc<dyn CalDavClient>, CalDavError> {
        Ok(self.0.clone())
    }
}

/// Planner fake: pops scripted change lists, counts calls, and can run a
/// hook while "thinking" (to simulate user edits racing the planner).
pub struct ScriptedPlanner {
    configured: bool,
    responses: Mutex<VecDeque<Vec<serde_json::Value>>>,
    pub calls: AtomicUsize,
    pub on_generate: Mutex<Option<GenerateHook>>,
}

impl ScriptedPlanner {
    pub fn new(configured: bool) -> Self {
        ScriptedPlanner {
            configured,
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            on_generate: Mutex::new(None),
        }
    }

    pub fn push_changes(&self, changes: Vec<serde_json::Value>) {
        self.responses.lock().unwrap().push_back(changes);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlannerClient for ScriptedPlanner {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<PlannerResponse, avocado_ai::PlannerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_generate.lock().unwrap().as_ref() {
            hook();
        }
        let changes = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(PlannerResponse { changes })
    }

    async fn test(&self) -> (bool, String) {
        (true, "ok".to_string())
    }

    async fn list_models(&self) -> Result<Vec<String>, avocado_ai::PlannerError> {
        Ok(vec!["gpt-test".to_string()])
    }
}

pub struct ScriptedPlannerConnector(pub Arc<ScriptedPlanner>);

impl PlannerConnector for ScriptedPlannerConnector {
    fn connect(&self, _config: &AiConfig) -> Arc<dyn PlannerClient> {
        self.0.clone()
    }
}

pub const STAGE_CAL: &str = "stage-cal";
pub const USER_CAL: &str = "user-cal";
pub const INTAKE_CAL: &str = "intake-cal";

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub caldav: Arc<FakeCalDav>,
    pub planner: Arc<ScriptedPlanner>,
    pub state: StateStore,
    pub config_store: Arc<ConfigStore>,
    _config_dir: TempDir,
}

impl Harness {
    pub async fn audit_actions(&self) -> Vec<String> {
        self.state
            .recent_audit_events(500)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.action)
            .collect()
    }

    pub async fn audits_for(&self, action: &str) -> Vec<avocado_store::AuditEventRow> {
        self.state
            .recent_audit_events(500)
            .await
            .unwrap()
            .into_iter()
            .filter(|row| row.action == action)
            .collect()
    }
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config_store = Arc::new(ConfigStore::open(dir.path().join("config.yaml")).unwrap());
    config_store
        .update(&json!({
            "caldav": {
                "base_url": "https://dav.example.com",
                "username": "tester",
                "password": "pw",
            },
            "ai": {
                "base_url": "https://ai.example.com/v1",
                "api_key": "key",
                "model": "gpt-test",
            },
            "calendar_rules": {
                "staging_calendar_id": STAGE_CAL,
                "user_calendar_id": USER_CAL,
                "intake_calendar_id": INTAKE_CAL,
            },
        }))
        .unwrap();

    let caldav = Arc::new(FakeCalDav::new());
    caldav.add_calendar(STAGE_CAL, "Avocado AI Staging");
    caldav.add_calendar(USER_CAL, "Avocado User Calendar");
    caldav.add_calendar(INTAKE_CAL, "Avocado New Events");

    let planner = Arc::new(ScriptedPlanner::new(true));
    let state = StateStore::in_memory().await.unwrap();

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&config_store),
        state.clone(),
        Arc::new(FakeCalDavConnector(Arc::clone(&caldav))),
        Arc::new(ScriptedPlannerConnector(Arc::clone(&planner))),
    ));

    Harness {
        engine,
        caldav,
        planner,
        state,
        config_store,
        _config_dir: dir,
    }
}

/// An event with start/end inside today's planning window.
pub fn timed_event(calendar_id: &str, uid: &str, summary: &str) -> EventRecord {
    let mut event = EventRecord::new(calendar_id, uid);
    event.summary = summary.to_string();
    event.start = Some(Utc::now() + chrono::Duration::hours(1));
    event.end = Some(Utc::now() + chrono::Duration::hours(2));
    event
}
