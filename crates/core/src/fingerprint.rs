//! Content fingerprints
//!
//! The replan gate compares stage and user twins by a hash of the mutable
//! fields only; href/etag churn must not trigger planning.

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use crate::models::EventRecord;

/// Hex SHA-1 of a text payload.
pub fn hash_text(value: &str) -> String {
    hex::encode(Sha1::digest(value.as_bytes()))
}

fn iso_or_empty(value: Option<&DateTime<Utc>>) -> String {
    value.map(|dt| dt.to_rfc3339()).unwrap_or_default()
}

/// Fingerprint of the five planner-visible fields.
pub fn event_fingerprint(event: &EventRecord) -> String {
    hash_text(&format!(
        "{}|{}|{}|{}|{}",
        event.summary,
        event.description,
        event.location,
        iso_or_empty(event.start.as_ref()),
        iso_or_empty(event.end.as_ref()),
    ))
}

/// Hash stored with each event snapshot row.
pub fn snapshot_payload_hash(event: &EventRecord) -> String {
    hash_text(&format!(
        "{}|{}|{}|{}",
        event.summary,
        event.description,
        iso_or_empty(event.start.as_ref()),
        iso_or_empty(event.end.as_ref()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_iso_datetime;

    fn sample_event() -> EventRecord {
        let mut event = EventRecord::new("cal-1", "uid-1");
        event.summary = "Gym".to_string();
        event.description = "Leg day".to_string();
        event.location = "Downtown".to_string();
        event.start = Some(parse_iso_datetime("2026-03-01T18:00:00Z").unwrap());
        event.end = Some(parse_iso_datetime("2026-03-01T19:00:00Z").unwrap());
        event
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(event_fingerprint(&sample_event()), event_fingerprint(&sample_event()));
    }

    #[test]
    fn test_fingerprint_ignores_etag_and_href() {
        let mut changed = sample_event();
        changed.etag = "different".to_string();
        changed.href = "/somewhere.ics".to_string();
        assert_eq!(event_fingerprint(&sample_event()), event_fingerprint(&changed));
    }

    #[test]
    fn test_fingerprint_tracks_mutable_fields() {
        let base = sample_event();
        for mutate in [
            |e: &mut EventRecord| e.summary = "Pool".to_string(),
            |e: &mut EventRecord| e.description = "Arm day".to_string(),
            |e: &mut EventRecord| e.location = "Uptown".to_string(),
            |e: &mut EventRecord| {
                e.start = Some(parse_iso_datetime("2026-03-01T17:30:00Z").unwrap());
            },
            |e: &mut EventRecord| e.end = None,
        ] {
            let mut changed = sample_event();
            mutate(&mut changed);
            assert_ne!(event_fingerprint(&base), event_fingerprint(&changed));
        }
    }

    #[test]
    fn test_hash_text_is_hex_sha1() {
        let digest = hash_text("avocado");
        assert_eq!(digest.len(), 40);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
