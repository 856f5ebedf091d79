//! HTTP CalDAV client
//!
//! One instance serves one reconciliation run; discovered calendars are
//! cached for the lifetime of the instance.

use async_trait::async_trait;
use avocado_core::config::CalDavConfig;
use avocado_core::models::{
    CalendarInfo, EventRecord, normalize_calendar_id, normalize_calendar_name,
};
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use url::Url;

use crate::error::CalDavError;
use crate::ical;
use crate::xml;
use crate::{CalDavClient, CalDavConnector};

pub struct HttpCalDavClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
    calendars: Mutex<HashMap<String, CalendarInfo>>,
}

impl HttpCalDavClient {
    pub fn new(config: &CalDavConfig) -> Result<Self, CalDavError> {
        if !config.is_complete() {
            return Err(CalDavError::IncompleteConfig);
        }
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| CalDavError::InvalidUrl(format!("invalid base_url {base}: {e}")))?;
        Ok(HttpCalDavClient {
            http: reqwest::Client::new(),
            base_url,
            username: config.username.trim().to_string(),
            password: config.password.clone(),
            calendars: Mutex::new(HashMap::new()),
        })
    }

    fn method(name: &'static str) -> Method {
        Method::from_bytes(name.as_bytes()).unwrap_or(Method::GET)
    }

    fn absolute(&self, href: &str) -> Result<Url, CalDavError> {
        self.base_url
            .join(href)
            .map_err(|e| CalDavError::InvalidUrl(format!("invalid href {href}: {e}")))
    }

    async fn dav_request(
        &self,
        method: Method,
        url: Url,
        depth: Option<&str>,
        body: Option<String>,
        content_type: &str,
    ) -> Result<(StatusCode, String, Option<String>), CalDavError> {
        let mut request = self
            .http
            .request(method, url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", content_type);
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());
        let text = response.text().await.unwrap_or_default();
        if !(status.is_success() || status == StatusCode::MULTI_STATUS) {
            return Err(CalDavError::from_status(
                status.as_u16(),
                url.to_string(),
                text,
            ));
        }
        Ok((status, text, etag))
    }

    async fn discover_calendars(&self) -> Result<Vec<CalendarInfo>, CalDavError> {
        let (_, body, _) = self
            .dav_request(
                Self::method("PROPFIND"),
                self.base_url.clone(),
                Some("1"),
                Some(xml::PROPFIND_CALENDARS.to_string()),
                "application/xml; charset=utf-8",
            )
            .await?;
        let collections = xml::parse_collections(&body)?;
        let mut infos = Vec::new();
        let mut cache = self.calendars.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        for collection in collections {
            if !collection.is_calendar {
                continue;
            }
            let url = self.absolute(&collection.href)?;
            let calendar_id = normalize_calendar_id(url.as_str());
            let name = if collection.display_name.is_empty() {
                calendar_id.clone()
            } else {
                collection.display_name.clone()
            };
            let info = CalendarInfo {
                calendar_id: calendar_id.clone(),
                name,
                url: url.to_string(),
            };
            cache.insert(calendar_id, info.clone());
            infos.push(info);
        }
        debug!(count = infos.len(), "discovered calendars");
        Ok(infos)
    }

    async fn calendar_url(&self, calendar_id: &str) -> Result<Url, CalDavError> {
        let normalized = normalize_calendar_id(calendar_id);
        {
            let cache = self.calendars.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(info) = cache.get(&normalized) {
                return Url::parse(&info.url)
                    .map_err(|e| CalDavError::InvalidUrl(format!("invalid calendar url: {e}")));
            }
        }
        // Cache miss: refresh the listing once before giving up.
        for info in self.discover_calendars().await? {
            if normalize_calendar_id(&info.calendar_id) == normalized {
                return Url::parse(&info.url)
                    .map_err(|e| CalDavError::InvalidUrl(format!("invalid calendar url: {e}")));
            }
        }
        Err(CalDavError::CalendarNotFound(calendar_id.to_string()))
    }

    fn resource_url(&self, calendar_url: &Url, uid: &str) -> Result<Url, CalDavError> {
        let filename = format!("{}.ics", urlencoding::encode(uid));
        calendar_url
            .join(&filename)
            .map_err(|e| CalDavError::InvalidUrl(format!("invalid resource name {uid}: {e}")))
    }

    async fn report(
        &self,
        calendar_id: &str,
        body: String,
    ) -> Result<Vec<EventRecord>, CalDavError> {
        let calendar_url = self.calendar_url(calendar_id).await?;
        let (_, text, _) = self
            .dav_request(
                Self::method("REPORT"),
                calendar_url,
                Some("1"),
                Some(body),
                "application/xml; charset=utf-8",
            )
            .await?;
        let mut events = Vec::new();
        for resource in xml::parse_event_resources(&text)? {
            if resource.calendar_data.trim().is_empty() {
                continue;
            }
            let etag = if resource.etag.is_empty() {
                avocado_core::hash_text(&resource.calendar_data)
            } else {
                resource.etag.clone()
            };
            match ical::ical_to_event(calendar_id, &resource.href, &etag, &resource.calendar_data)
            {
                Ok(event) => {
                    if !event.uid.is_empty() {
                        events.push(event);
                    }
                }
                Err(e) => {
                    warn!(href = %resource.href, error = %e, "skipping unparseable resource");
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl CalDavClient for HttpCalDavClient {
    async fn list_calendars(&self) -> Result<Vec<CalendarInfo>, CalDavError> {
        self.discover_calendars().await
    }

    async fn ensure_calendar(
        &self,
        calendar_id: &str,
        calendar_name: &str,
    ) -> Result<CalendarInfo, CalDavError> {
        let calendars = self.discover_calendars().await?;
        let id_key = normalize_calendar_id(calendar_id);
        if !id_key.is_empty() {
            if let Some(found) = calendars
                .iter()
                .find(|c| normalize_calendar_id(&c.calendar_id) == id_key)
            {
                return Ok(found.clone());
            }
        }
        let name_key = normalize_calendar_name(calendar_name);
        if !name_key.is_empty() {
            let mut same_name: Vec<&CalendarInfo> = calendars
                .iter()
                .filter(|c| normalize_calendar_name(&c.name) == name_key)
                .collect();
            if !same_name.is_empty() {
                same_name.sort_by(|a, b| a.calendar_id.cmp(&b.calendar_id));
                return Ok(same_name[0].clone());
            }
        }

        let slug = uuid::Uuid::new_v4().to_string();
        let collection_url = self
            .base_url
            .join(&format!("{slug}/"))
            .map_err(|e| CalDavError::InvalidUrl(format!("invalid collection slug: {e}")))?;
        self.dav_request(
            Self::method("MKCALENDAR"),
            collection_url.clone(),
            None,
            Some(xml::mkcalendar_body(calendar_name)),
            "application/xml; charset=utf-8",
        )
        .await?;
        debug!(name = calendar_name, url = %collection_url, "created calendar");

        let refreshed = self.discover_calendars().await?;
        let created_key = normalize_calendar_id(collection_url.as_str());
        if let Some(found) = refreshed
            .iter()
            .find(|c| normalize_calendar_id(&c.calendar_id) == created_key)
        {
            return Ok(found.clone());
        }
        if !name_key.is_empty() {
            let mut same_name: Vec<&CalendarInfo> = refreshed
                .iter()
                .filter(|c| normalize_calendar_name(&c.name) == name_key)
                .collect();
            if !same_name.is_empty() {
                same_name.sort_by(|a, b| a.calendar_id.cmp(&b.calendar_id));
                return Ok(same_name[0].clone());
            }
        }
        Ok(CalendarInfo {
            calendar_id: normalize_calendar_id(collection_url.as_str()),
            name: calendar_name.to_string(),
            url: collection_url.to_string(),
        })
    }

    async fn fetch_events(
        &self,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, CalDavError> {
        self.report(calendar_id, xml::calendar_query_body(start, end))
            .await
    }

    async fn upsert_event(
        &self,
        calendar_id: &str,
        event: &EventRecord,
    ) -> Result<EventRecord, CalDavError> {
        let calendar_url = self.calendar_url(calendar_id).await?;
        let target = if event.href.is_empty() {
            self.resource_url(&calendar_url, &event.uid)?
        } else {
            self.absolute(&event.href)?
        };
        let raw = ical::event_to_ical(event);
        let (_, _, header_etag) = self
            .dav_request(
                Method::PUT,
                target.clone(),
                None,
                Some(raw.clone()),
                "text/calendar; charset=utf-8",
            )
            .await?;

        let mut saved = event.clone();
        saved.calendar_id = calendar_id.to_string();
        saved.href = target.path().to_string();
        saved.etag = match header_etag {
            Some(etag) => etag,
            None => {
                // Server did not return an ETag on PUT; fall back to the
                // stored representation so the next read agrees with us.
                match self.get_event_by_uid(calendar_id, &event.uid).await? {
                    Some(stored) => stored.etag,
                    None => avocado_core::hash_text(&raw),
                }
            }
        };
        Ok(saved)
    }

    async fn delete_event(
        &self,
        calendar_id: &str,
        uid: &str,
        href: &str,
    ) -> Result<bool, CalDavError> {
        let target = if !href.is_empty() {
            Some(self.absolute(href)?)
        } else if !uid.is_empty() {
            match self.get_event_by_uid(calendar_id, uid).await? {
                Some(event) if !event.href.is_empty() => Some(self.absolute(&event.href)?),
                _ => None,
            }
        } else {
            None
        };
        let Some(target) = target else {
            return Ok(false);
        };
        match self
            .dav_request(Method::DELETE, target, None, None, "text/plain")
            .await
        {
            Ok(_) => Ok(true),
            Err(CalDavError::Status { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_event_by_uid(
        &self,
        calendar_id: &str,
        uid: &str,
    ) -> Result<Option<EventRecord>, CalDavError> {
        if uid.is_empty() {
            return Ok(None);
        }
        let events = self.report(calendar_id, xml::uid_query_body(uid)).await?;
        Ok(events.into_iter().find(|e| e.uid == uid))
    }
}

/// Default connector handing out one HTTP client per run.
#[derive(Debug, Default, Clone)]
pub struct HttpCalDavConnector;

impl CalDavConnector for HttpCalDavConnector {
    fn connect(&self, config: &CalDavConfig) -> Result<Arc<dyn CalDavClient>, CalDavError> {
        Ok(Arc::new(HttpCalDavClient::new(config)?))
    }
}
