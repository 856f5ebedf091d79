//! Application configuration schema
//!
//! Typed view of the YAML configuration file. Loading is tolerant: every
//! section falls back to defaults, and [`AppConfig::normalized`] clamps the
//! values the engine depends on (window and interval minimums, editable
//! field subsets, per-calendar modes).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_EDITABLE_FIELDS: [&str; 5] =
    ["start", "end", "summary", "location", "description"];

pub const DEFAULT_STAGING_CALENDAR_NAME: &str = "Avocado AI Staging";
pub const DEFAULT_USER_CALENDAR_NAME: &str = "Avocado User Calendar";
pub const DEFAULT_INTAKE_CALENDAR_NAME: &str = "Avocado New Events";

pub const MIN_WINDOW_DAYS: u32 = 1;
pub const MIN_INTERVAL_SECONDS: u64 = 30;

fn default_editable_fields() -> Vec<String> {
    DEFAULT_EDITABLE_FIELDS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalDavConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl CalDavConfig {
    /// The engine refuses to run without at least a server and a login.
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.username.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub system_prompt: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        AiConfig {
            base_url: String::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 90,
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub window_days: u32,
    pub interval_seconds: u64,
    pub timezone: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            window_days: 7,
            interval_seconds: 300,
            timezone: "UTC".to_string(),
        }
    }
}

/// Per-calendar behavior mode. Anything unrecognized degrades to editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarMode {
    Editable,
    Immutable,
}

impl Default for CalendarMode {
    fn default() -> Self {
        CalendarMode::Editable
    }
}

impl<'de> Deserialize<'de> for CalendarMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.trim().to_lowercase().as_str() {
            "immutable" => CalendarMode::Immutable,
            _ => CalendarMode::Editable,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerCalendarDefault {
    pub mode: CalendarMode,
    pub locked: bool,
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarRulesConfig {
    pub immutable_keywords: Vec<String>,
    pub immutable_calendar_ids: Vec<String>,
    pub staging_calendar_id: String,
    pub staging_calendar_name: String,
    pub user_calendar_id: String,
    pub user_calendar_name: String,
    pub intake_calendar_id: String,
    pub intake_calendar_name: String,
    pub per_calendar_defaults: BTreeMap<String, PerCalendarDefault>,
}

impl Default for CalendarRulesConfig {
    fn default() -> Self {
        CalendarRulesConfig {
            immutable_keywords: vec!["work".to_string(), "固定".to_string(), "fixed".to_string()],
            immutable_calendar_ids: Vec::new(),
            staging_calendar_id: String::new(),
            staging_calendar_name: DEFAULT_STAGING_CALENDAR_NAME.to_string(),
            user_calendar_id: String::new(),
            user_calendar_name: DEFAULT_USER_CALENDAR_NAME.to_string(),
            intake_calendar_id: String::new(),
            intake_calendar_name: DEFAULT_INTAKE_CALENDAR_NAME.to_string(),
            per_calendar_defaults: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaultsConfig {
    pub locked: bool,
    pub mandatory: bool,
    pub editable_fields: Vec<String>,
}

impl Default for TaskDefaultsConfig {
    fn default() -> Self {
        TaskDefaultsConfig {
            locked: false,
            mandatory: false,
            editable_fields: default_editable_fields(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub caldav: CalDavConfig,
    pub ai: AiConfig,
    pub sync: SyncConfig,
    pub calendar_rules: CalendarRulesConfig,
    pub task_defaults: TaskDefaultsConfig,
}

fn cleaned_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

impl AppConfig {
    /// Clamp every field the engine relies on to its legal range.
    pub fn normalized(mut self) -> Self {
        self.caldav.base_url = self.caldav.base_url.trim().to_string();
        self.caldav.username = self.caldav.username.trim().to_string();

        self.ai.base_url = self.ai.base_url.trim().to_string();
        self.ai.api_key = self.ai.api_key.trim().to_string();
        self.ai.model = self.ai.model.trim().to_string();
        if self.ai.model.is_empty() {
            self.ai.model = AiConfig::default().model;
        }

        self.sync.window_days = self.sync.window_days.max(MIN_WINDOW_DAYS);
        self.sync.interval_seconds = self.sync.interval_seconds.max(MIN_INTERVAL_SECONDS);
        self.sync.timezone = self.sync.timezone.trim().to_string();
        if self.sync.timezone.parse::<chrono_tz::Tz>().is_err() {
            self.sync.timezone = "UTC".to_string();
        }

        let rules = &mut self.calendar_rules;
        rules.immutable_keywords = cleaned_list(&rules.immutable_keywords);
        rules.immutable_calendar_ids = cleaned_list(&rules.immutable_calendar_ids);
        rules.staging_calendar_name = rules.staging_calendar_name.trim().to_string();
        if rules.staging_calendar_name.is_empty() {
            rules.staging_calendar_name = DEFAULT_STAGING_CALENDAR_NAME.to_string();
        }
        rules.user_calendar_name = rules.user_calendar_name.trim().to_string();
        if rules.user_calendar_name.is_empty() {
            rules.user_calendar_name = DEFAULT_USER_CALENDAR_NAME.to_string();
        }
        rules.intake_calendar_name = rules.intake_calendar_name.trim().to_string();
        if rules.intake_calendar_name.is_empty() {
            rules.intake_calendar_name = DEFAULT_INTAKE_CALENDAR_NAME.to_string();
        }
        rules.per_calendar_defaults = rules
            .per_calendar_defaults
            .iter()
            .filter_map(|(key, value)| {
                let calendar_id = key.trim().to_string();
                if calendar_id.is_empty() {
                    None
                } else {
                    Some((calendar_id, value.clone()))
                }
            })
            .collect();

        self.task_defaults.editable_fields = cleaned_list(&self.task_defaults.editable_fields);
        if self.task_defaults.editable_fields.is_empty() {
            self.task_defaults.editable_fields = default_editable_fields();
        }

        self
    }
}
