//! WebDAV request bodies and multistatus parsing
//!
//! Requests are small fixed documents; responses are walked with a
//! quick-xml `Reader` keyed on local names so namespace prefixes do not
//! matter.

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::CalDavError;

pub const PROPFIND_CALENDARS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

fn caldav_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y%m%dT%H%M%SZ").to_string()
}

/// calendar-query REPORT over a time window; the server expands recurring
/// events into instances.
pub fn calendar_query_body(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let start = caldav_timestamp(start);
    let end = caldav_timestamp(end);
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data>
      <c:expand start="{start}" end="{end}"/>
    </c:calendar-data>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT">
        <c:time-range start="{start}" end="{end}"/>
      </c:comp-filter>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#
    )
}

/// calendar-query REPORT matching a single UID.
pub fn uid_query_body(uid: &str) -> String {
    let escaped = escape_xml_text(uid);
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT">
        <c:prop-filter name="UID">
          <c:text-match collation="i;octet">{escaped}</c:text-match>
        </c:prop-filter>
      </c:comp-filter>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#
    )
}

/// MKCALENDAR body carrying the display name.
pub fn mkcalendar_body(display_name: &str) -> String {
    let escaped = escape_xml_text(display_name);
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<c:mkcalendar xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:set>
    <d:prop>
      <d:displayname>{escaped}</d:displayname>
    </d:prop>
  </d:set>
</c:mkcalendar>"#
    )
}

fn escape_xml_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// One `<response>` of a PROPFIND over the calendar home.
#[derive(Debug, Clone, Default)]
pub struct DavCollection {
    pub href: String,
    pub display_name: String,
    pub is_calendar: bool,
}

/// One `<response>` of a calendar-query REPORT.
#[derive(Debug, Clone, Default)]
pub struct DavEventResource {
    pub href: String,
    pub etag: String,
    pub calendar_data: String,
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_string()
}

fn decode_text(e: &quick_xml::events::BytesText<'_>) -> String {
    e.decode().map(|c| c.into_owned()).unwrap_or_default()
}

fn decode_general_ref(e: &quick_xml::events::BytesRef<'_>) -> String {
    if let Ok(Some(ch)) = e.resolve_char_ref() {
        return ch.to_string();
    }
    if let Ok(name) = e.decode() {
        if let Some(resolved) = quick_xml::escape::resolve_xml_entity(&name) {
            return resolved.to_string();
        }
    }
    String::new()
}

/// Parse a PROPFIND multistatus into the collections it describes.
pub fn parse_collections(xml: &str) -> Result<Vec<DavCollection>, CalDavError> {
    let mut reader = Reader::from_str(xml);
    let mut collections = Vec::new();
    let mut current = DavCollection::default();
    let mut in_response = false;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.local_name().as_ref()).as_str() {
                "response" => {
                    in_response = true;
                    current = DavCollection::default();
                }
                "href" if in_response => field = Some("href"),
                "displayname" if in_response => field = Some("displayname"),
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if in_response && local_name(e.local_name().as_ref()) == "calendar" {
                    current.is_calendar = true;
                }
            }
            Ok(Event::Text(e)) => {
                let text = decode_text(&e);
                match field {
                    Some("href") => current.href.push_str(&text),
                    Some("displayname") => current.display_name.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::GeneralRef(e)) => {
                let text = decode_general_ref(&e);
                match field {
                    Some("href") => current.href.push_str(&text),
                    Some("displayname") => current.display_name.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match local_name(e.local_name().as_ref()).as_str() {
                "response" => {
                    in_response = false;
                    collections.push(current.clone());
                }
                "href" => {
                    current.href = current.href.trim().to_string();
                    field = None;
                }
                "displayname" => {
                    current.display_name = current.display_name.trim().to_string();
                    field = None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(CalDavError::Xml(e.to_string())),
            _ => {}
        }
    }
    Ok(collections)
}

/// Parse a REPORT multistatus into event resources.
pub fn parse_event_resources(xml: &str) -> Result<Vec<DavEventResource>, CalDavError> {
    let mut reader = Reader::from_str(xml);
    let mut resources = Vec::new();
    let mut current = DavEventResource::default();
    let mut in_response = false;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.local_name().as_ref()).as_str() {
                "response" => {
                    in_response = true;
                    current = DavEventResource::default();
                }
                "href" if in_response => field = Some("href"),
                "getetag" if in_response => field = Some("getetag"),
                "calendar-data" if in_response => field = Some("calendar-data"),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = decode_text(&e);
                match field {
                    Some("href") => current.href.push_str(&text),
                    Some("getetag") => current.etag.push_str(&text),
                    Some("calendar-data") => current.calendar_data.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::GeneralRef(e)) => {
                let text = decode_general_ref(&e);
                match field {
                    Some("href") => current.href.push_str(&text),
                    Some("getetag") => current.etag.push_str(&text),
                    Some("calendar-data") => current.calendar_data.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::CData(e)) => {
                if field == Some("calendar-data") {
                    current
                        .calendar_data
                        .push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(e)) => match local_name(e.local_name().as_ref()).as_str() {
                "response" => {
                    in_response = false;
                    resources.push(current.clone());
                }
                "href" => {
                    current.href = current.href.trim().to_string();
                    field = None;
                }
                "getetag" => {
                    current.etag = current.etag.trim().trim_matches('"').to_string();
                    field = None;
                }
                "calendar-data" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(CalDavError::Xml(e.to_string())),
            _ => {}
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collections() {
        let xml = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/dav/user/</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>Home</d:displayname>
        <d:resourcetype><d:collection/></d:resourcetype>
      </d:prop>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/user/personal/</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>Personal</d:displayname>
        <d:resourcetype><d:collection/><c:calendar/></d:resourcetype>
      </d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>"#;
        let collections = parse_collections(xml).unwrap();
        assert_eq!(collections.len(), 2);
        assert!(!collections[0].is_calendar);
        assert!(collections[1].is_calendar);
        assert_eq!(collections[1].href, "/dav/user/personal/");
        assert_eq!(collections[1].display_name, "Personal");
    }

    #[test]
    fn test_parse_event_resources() {
        let xml = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/dav/user/personal/evt-1.ics</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"abc123"</d:getetag>
        <c:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:evt-1
SUMMARY:Coffee &amp; cake
DTSTART:20260301T100000Z
END:VEVENT
END:VCALENDAR</c:calendar-data>
      </d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>"#;
        let resources = parse_event_resources(xml).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].href, "/dav/user/personal/evt-1.ics");
        assert_eq!(resources[0].etag, "abc123");
        assert!(resources[0].calendar_data.contains("UID:evt-1"));
        assert!(resources[0].calendar_data.contains("Coffee & cake"));
    }

    #[test]
    fn test_query_body_contains_window() {
        let start = "2026-03-01T00:00:00Z".parse().unwrap();
        let end = "2026-03-07T23:59:59Z".parse().unwrap();
        let body = calendar_query_body(start, end);
        assert!(body.contains("20260301T000000Z"));
        assert!(body.contains("20260307T235959Z"));
        assert!(body.contains("time-range"));
    }

    #[test]
    fn test_uid_query_escapes_text() {
        let body = uid_query_body("a<b&c");
        assert!(body.contains("a&lt;b&amp;c"));
    }
}
