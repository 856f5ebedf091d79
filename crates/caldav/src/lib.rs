//! Avocado CalDAV - calendar collection client
//!
//! The engine only depends on the capability traits here; the HTTP
//! implementation speaks PROPFIND/REPORT/PUT/DELETE with reqwest and parses
//! multistatus documents with quick-xml.

mod client;
pub mod error;
pub mod ical;
mod xml;

pub use client::{HttpCalDavClient, HttpCalDavConnector};
pub use error::CalDavError;

use async_trait::async_trait;
use avocado_core::config::CalDavConfig;
use avocado_core::models::{CalendarInfo, EventRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One connected CalDAV principal for the duration of a run.
#[async_trait]
pub trait CalDavClient: Send + Sync {
    /// Every calendar collection visible to the principal.
    async fn list_calendars(&self) -> Result<Vec<CalendarInfo>, CalDavError>;

    /// Resolve a managed calendar by id, then by exact normalized name,
    /// creating it when neither matches.
    async fn ensure_calendar(
        &self,
        calendar_id: &str,
        calendar_name: &str,
    ) -> Result<CalendarInfo, CalDavError>;

    /// Events inside the window; the server expands recurrences.
    async fn fetch_events(
        &self,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, CalDavError>;

    /// Write an event and return it with the server-assigned href and etag.
    async fn upsert_event(
        &self,
        calendar_id: &str,
        event: &EventRecord,
    ) -> Result<EventRecord, CalDavError>;

    /// Delete by UID or href; `false` when nothing matched.
    async fn delete_event(
        &self,
        calendar_id: &str,
        uid: &str,
        href: &str,
    ) -> Result<bool, CalDavError>;

    /// Fetch a single event by UID.
    async fn get_event_by_uid(
        &self,
        calendar_id: &str,
        uid: &str,
    ) -> Result<Option<EventRecord>, CalDavError>;
}

/// Builds a client per run from the current configuration.
pub trait CalDavConnector: Send + Sync {
    fn connect(&self, config: &CalDavConfig) -> Result<Arc<dyn CalDavClient>, CalDavError>;
}
