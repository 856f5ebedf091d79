//! Core domain models
//!
//! These models represent calendar events and run outcomes as the engine
//! sees them; persistence and wire formats live in the outer crates.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which layer an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    User,
    Staging,
    System,
}

impl Default for EventSource {
    fn default() -> Self {
        EventSource::User
    }
}

/// A single calendar event as fetched from (or destined for) a CalDAV
/// collection.
///
/// Identity is the `(calendar_id, uid)` pair; `href` and `etag` are
/// server-assigned and may be empty until the first write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub calendar_id: String,
    pub uid: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub original_calendar_id: String,
    #[serde(default)]
    pub original_uid: String,
}

impl EventRecord {
    pub fn new(calendar_id: impl Into<String>, uid: impl Into<String>) -> Self {
        EventRecord {
            calendar_id: calendar_id.into(),
            uid: uid.into(),
            summary: String::new(),
            description: String::new(),
            location: String::new(),
            start: None,
            end: None,
            all_day: false,
            href: String::new(),
            etag: String::new(),
            source: EventSource::User,
            locked: false,
            mandatory: false,
            original_calendar_id: String::new(),
            original_uid: String::new(),
        }
    }

    /// Identity key: two events are the same iff calendar and UID match.
    pub fn key(&self) -> (&str, &str) {
        (&self.calendar_id, &self.uid)
    }
}

/// A calendar collection as reported by the CalDAV server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub calendar_id: String,
    pub name: String,
    pub url: String,
}

/// Role tag for one of the three managed calendars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedRole {
    Staging,
    User,
    Intake,
}

impl ManagedRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagedRole::Staging => "staging",
            ManagedRole::User => "user",
            ManagedRole::Intake => "intake",
        }
    }
}

/// Classification of every calendar known to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarRole {
    Immutable,
    EditableSource,
    Intake,
    User,
    Stage,
    ManagedDuplicate(ManagedRole),
}

/// Why a run started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    Startup,
    Manual,
    Scheduled,
    ManualWindow,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
            Trigger::ManualWindow => "manual-window",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "startup" => Ok(Trigger::Startup),
            "manual" => Ok(Trigger::Manual),
            "scheduled" => Ok(Trigger::Scheduled),
            "manual-window" => Ok(Trigger::ManualWindow),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Skipped,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Skipped => "skipped",
            SyncStatus::Error => "error",
        }
    }
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub message: String,
    pub duration_ms: i64,
    pub changes_applied: i64,
    pub conflicts: i64,
    pub trigger: Trigger,
    pub run_at: DateTime<Utc>,
}

/// Parse an ISO-8601 instant, accepting a trailing `Z`, an explicit offset,
/// or a naive datetime which is taken as UTC.
pub fn parse_iso_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let text = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    match chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => Ok(naive.and_utc()),
        Err(_) => {
            // Surface the RFC 3339 error for anything we cannot interpret.
            DateTime::parse_from_rfc3339(text).map(|parsed| parsed.with_timezone(&Utc))
        }
    }
}

/// Collapse whitespace and fold case so calendar names compare loosely.
pub fn normalize_calendar_name(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Calendar ids are URLs on most servers; the trailing slash is not
/// significant.
pub fn normalize_calendar_id(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

/// Default planning window: start of today through the end of the last day
/// covered by `window_days`, in UTC.
pub fn planning_window(now: DateTime<Utc>, window_days: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let days = window_days.max(1);
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end_date = start.date_naive() + Duration::days(i64::from(days) - 1);
    let end_time = NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN);
    let end = end_date.and_time(end_time).and_utc();
    (start, end)
}
