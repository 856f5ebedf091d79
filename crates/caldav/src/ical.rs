//! iCalendar serialization/deserialization
//!
//! Events are written with the `icalendar` crate and read back with a
//! line-based VEVENT parser (folded lines are unfolded first, escaped text
//! is unescaped so multi-line descriptions survive the round trip).

use avocado_core::models::EventRecord;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use icalendar::{Calendar, Component, Event as IcalEvent, EventLike};

use crate::error::CalDavError;

/// Render an event as a VCALENDAR document.
pub fn event_to_ical(event: &EventRecord) -> String {
    let mut ical_event = IcalEvent::new();
    ical_event.uid(&event.uid);
    ical_event.summary(&event.summary);
    ical_event.description(&event.description);
    if !event.location.is_empty() {
        ical_event.location(&event.location);
    }
    if event.all_day {
        if let Some(start) = event.start {
            ical_event.all_day(start.date_naive());
        }
    } else {
        if let Some(start) = event.start {
            ical_event.starts(start);
        }
        if let Some(end) = event.end {
            ical_event.ends(end);
        }
    }

    let mut calendar = Calendar::new();
    calendar.push(ical_event);
    calendar.to_string()
}

/// Join folded continuation lines (RFC 5545 §3.1).
fn unfold(raw: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in raw.lines() {
        if (line.starts_with(' ') || line.starts_with('\t')) && !lines.is_empty() {
            if let Some(last) = lines.last_mut() {
                last.push_str(&line[1..]);
            }
        } else {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Undo TEXT escaping: `\n`, `\,`, `\;`, `\\`.
fn unescape_text(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => output.push('\n'),
            Some(',') => output.push(','),
            Some(';') => output.push(';'),
            Some('\\') => output.push('\\'),
            Some(other) => {
                output.push('\\');
                output.push(other);
            }
            None => output.push('\\'),
        }
    }
    output
}

fn parse_datetime(value: &str, is_date: bool, is_end: bool) -> Result<DateTime<Utc>, CalDavError> {
    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d")
            .map_err(|e| CalDavError::InvalidDatetime(format!("{value}: {e}")))?;
        let time = if is_end {
            NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN)
        } else {
            NaiveTime::MIN
        };
        return Ok(date.and_time(time).and_utc());
    }
    let trimmed = value.trim_end_matches('Z');
    chrono::NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S")
        .map(|dt| dt.and_utc())
        .map_err(|e| CalDavError::InvalidDatetime(format!("{value}: {e}")))
}

/// Parse the first VEVENT of a VCALENDAR document into an event record.
/// `href` and `etag` are server-side metadata the caller already holds.
pub fn ical_to_event(
    calendar_id: &str,
    href: &str,
    etag: &str,
    raw: &str,
) -> Result<EventRecord, CalDavError> {
    let mut in_vevent = false;
    let mut uid = String::new();
    let mut summary = String::new();
    let mut description = String::new();
    let mut location = String::new();
    let mut dtstart: Option<(String, bool)> = None;
    let mut dtend: Option<(String, bool)> = None;
    let mut seen_vevent = false;

    for line in unfold(raw) {
        let line = line.trim_end_matches('\r');
        if line == "BEGIN:VEVENT" {
            in_vevent = true;
            seen_vevent = true;
            continue;
        }
        if line == "END:VEVENT" {
            break;
        }
        if !in_vevent {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (prop_name, params) = match key.split_once(';') {
            Some((name, params)) => (name, Some(params)),
            None => (key, None),
        };
        match prop_name {
            "UID" => uid = value.trim().to_string(),
            "SUMMARY" => summary = unescape_text(value),
            "DESCRIPTION" => description = unescape_text(value),
            "LOCATION" => location = unescape_text(value),
            "DTSTART" => {
                let is_date = params
                    .map(|p| p.contains("VALUE=DATE") && !p.contains("VALUE=DATE-TIME"))
                    .unwrap_or(false);
                dtstart = Some((value.to_string(), is_date));
            }
            "DTEND" => {
                let is_date = params
                    .map(|p| p.contains("VALUE=DATE") && !p.contains("VALUE=DATE-TIME"))
                    .unwrap_or(false);
                dtend = Some((value.to_string(), is_date));
            }
            _ => {}
        }
    }

    if !seen_vevent {
        return Err(CalDavError::MissingVevent);
    }

    let all_day = dtstart.as_ref().map(|(_, is_date)| *is_date).unwrap_or(false);
    let start = match &dtstart {
        Some((value, is_date)) => Some(parse_datetime(value, *is_date, false)?),
        None => None,
    };
    let mut end = match &dtend {
        Some((value, is_date)) => Some(parse_datetime(value, *is_date, true)?),
        None => None,
    };
    if end.is_none() {
        end = start.map(|s| s + Duration::hours(1));
    }

    let mut event = EventRecord::new(calendar_id, uid);
    event.summary = summary.trim().to_string();
    event.description = description.trim().to_string();
    event.location = location.trim().to_string();
    event.start = start;
    event.end = end;
    event.all_day = all_day;
    event.href = href.to_string();
    event.etag = etag.to_string();
    Ok(event)
}
