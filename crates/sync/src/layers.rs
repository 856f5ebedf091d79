//! Layer manager: managed calendars, role classification, duplicate purge

use avocado_core::config::{AppConfig, CalendarMode};
use avocado_core::models::{
    CalendarInfo, CalendarRole, ManagedRole, normalize_calendar_id, normalize_calendar_name,
};
use std::collections::BTreeSet;

/// The three calendars this system owns.
#[derive(Debug, Clone)]
pub struct ManagedCalendars {
    pub stage: CalendarInfo,
    pub user: CalendarInfo,
    pub intake: CalendarInfo,
}

impl ManagedCalendars {
    pub fn ids(&self) -> [&str; 3] {
        [
            self.stage.calendar_id.as_str(),
            self.user.calendar_id.as_str(),
            self.intake.calendar_id.as_str(),
        ]
    }

    pub fn contains(&self, calendar_id: &str) -> bool {
        let key = normalize_calendar_id(calendar_id);
        self.ids().iter().any(|id| normalize_calendar_id(id) == key)
    }

    pub fn role_of(&self, calendar_id: &str) -> Option<ManagedRole> {
        let key = normalize_calendar_id(calendar_id);
        if normalize_calendar_id(&self.stage.calendar_id) == key {
            Some(ManagedRole::Staging)
        } else if normalize_calendar_id(&self.user.calendar_id) == key {
            Some(ManagedRole::User)
        } else if normalize_calendar_id(&self.intake.calendar_id) == key {
            Some(ManagedRole::Intake)
        } else {
            None
        }
    }
}

/// Whether `name` collides with a managed calendar name: equal after
/// normalization, or prefixed by `"<name> "` / `"<name>("`.
fn name_collides(name: &str, managed_name: &str) -> bool {
    let key = normalize_calendar_name(name);
    let managed_key = normalize_calendar_name(managed_name);
    if managed_key.is_empty() {
        return false;
    }
    key == managed_key
        || key.starts_with(&format!("{managed_key} "))
        || key.starts_with(&format!("{managed_key}("))
}

/// Calendar ids whose name matches an immutable keyword. This is the
/// "suggested" set the admin surface shows; the effective set also takes
/// explicit ids and per-calendar overrides into account.
pub fn keyword_suggested_calendar_ids(
    config: &AppConfig,
    calendars: &[CalendarInfo],
) -> BTreeSet<String> {
    let keywords: Vec<String> = config
        .calendar_rules
        .immutable_keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    let mut ids = BTreeSet::new();
    if keywords.is_empty() {
        return ids;
    }
    for calendar in calendars {
        let name = calendar.name.to_lowercase();
        if keywords.iter().any(|k| name.contains(k)) {
            ids.insert(normalize_calendar_id(&calendar.calendar_id));
        }
    }
    ids
}

/// Calendars treated as read-only constraints: explicit ids, keyword
/// matches on the name, and per-calendar `immutable` overrides, minus the
/// per-calendar `editable` overrides.
pub fn immutable_calendar_ids(config: &AppConfig, calendars: &[CalendarInfo]) -> BTreeSet<String> {
    let mut ids: BTreeSet<String> = config
        .calendar_rules
        .immutable_calendar_ids
        .iter()
        .map(|id| normalize_calendar_id(id))
        .collect();
    ids.extend(keyword_suggested_calendar_ids(config, calendars));

    for (calendar_id, behavior) in &config.calendar_rules.per_calendar_defaults {
        let key = normalize_calendar_id(calendar_id);
        match behavior.mode {
            CalendarMode::Immutable => {
                ids.insert(key);
            }
            CalendarMode::Editable => {
                ids.remove(&key);
            }
        }
    }
    ids
}

/// Assign exactly one role to every listed calendar.
pub fn classify_calendars(
    config: &AppConfig,
    calendars: &[CalendarInfo],
    managed: &ManagedCalendars,
) -> Vec<(CalendarInfo, CalendarRole)> {
    let immutable = immutable_calendar_ids(config, calendars);
    let rules = &config.calendar_rules;
    let mut classified = Vec::with_capacity(calendars.len());

    for calendar in calendars {
        let role = if let Some(managed_role) = managed.role_of(&calendar.calendar_id) {
            match managed_role {
                ManagedRole::Staging => CalendarRole::Stage,
                ManagedRole::User => CalendarRole::User,
                ManagedRole::Intake => CalendarRole::Intake,
            }
        } else if name_collides(&calendar.name, &rules.staging_calendar_name) {
            CalendarRole::ManagedDuplicate(ManagedRole::Staging)
        } else if name_collides(&calendar.name, &rules.user_calendar_name) {
            CalendarRole::ManagedDuplicate(ManagedRole::User)
        } else if name_collides(&calendar.name, &rules.intake_calendar_name) {
            CalendarRole::ManagedDuplicate(ManagedRole::Intake)
        } else if immutable.contains(&normalize_calendar_id(&calendar.calendar_id)) {
            CalendarRole::Immutable
        } else {
            CalendarRole::EditableSource
        };
        classified.push((calendar.clone(), role));
    }
    classified
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, name: &str) -> CalendarInfo {
        CalendarInfo {
            calendar_id: id.to_string(),
            name: name.to_string(),
            url: id.to_string(),
        }
    }

    fn managed() -> ManagedCalendars {
        ManagedCalendars {
            stage: info("stage-cal", "Avocado AI Staging"),
            user: info("user-cal", "Avocado User Calendar"),
            intake: info("intake-cal", "Avocado New Events"),
        }
    }

    #[test]
    fn test_managed_roles() {
        let managed = managed();
        assert!(managed.contains("user-cal"));
        assert!(managed.contains("user-cal/"));
        assert_eq!(managed.role_of("intake-cal"), Some(ManagedRole::Intake));
        assert_eq!(managed.role_of("other"), None);
    }

    #[test]
    fn test_classification_roles() {
        let config = AppConfig::default().normalized();
        let calendars = vec![
            info("stage-cal", "Avocado AI Staging"),
            info("user-cal", "Avocado User Calendar"),
            info("intake-cal", "Avocado New Events"),
            info("personal", "Personal"),
            info("job", "Work schedule"),
            info("dup-cal", "Avocado User Calendar"),
            info("dup-cal-2", "Avocado User Calendar (1)"),
            info("dup-cal-3", "Avocado User Calendar(copy)"),
        ];
        let classified = classify_calendars(&config, &calendars, &managed());
        let role_of = |id: &str| {
            classified
                .iter()
                .find(|(c, _)| c.calendar_id == id)
                .map(|(_, r)| *r)
                .unwrap()
        };
        assert_eq!(role_of("stage-cal"), CalendarRole::Stage);
        assert_eq!(role_of("user-cal"), CalendarRole::User);
        assert_eq!(role_of("intake-cal"), CalendarRole::Intake);
        assert_eq!(role_of("personal"), CalendarRole::EditableSource);
        // "work" is a default immutable keyword.
        assert_eq!(role_of("job"), CalendarRole::Immutable);
        assert_eq!(
            role_of("dup-cal"),
            CalendarRole::ManagedDuplicate(ManagedRole::User)
        );
        assert_eq!(
            role_of("dup-cal-2"),
            CalendarRole::ManagedDuplicate(ManagedRole::User)
        );
        assert_eq!(
            role_of("dup-cal-3"),
            CalendarRole::ManagedDuplicate(ManagedRole::User)
        );
    }

    #[test]
    fn test_immutable_overrides() {
        use avocado_core::config::PerCalendarDefault;

        let mut config = AppConfig::default();
        config.calendar_rules.immutable_calendar_ids = vec!["explicit".to_string()];
        config.calendar_rules.per_calendar_defaults.insert(
            "forced".to_string(),
            PerCalendarDefault {
                mode: CalendarMode::Immutable,
                locked: false,
                mandatory: false,
            },
        );
        config.calendar_rules.per_calendar_defaults.insert(
            "job".to_string(),
            PerCalendarDefault {
                mode: CalendarMode::Editable,
                locked: false,
                mandatory: false,
            },
        );
        let config = config.normalized();

        let calendars = vec![info("job", "Work schedule"), info("forced", "Groceries")];
        let ids = immutable_calendar_ids(&config, &calendars);
        assert!(ids.contains("explicit"));
        assert!(ids.contains("forced"));
        // The editable override wins over the keyword match.
        assert!(!ids.contains("job"));
    }
}
