//! Error types for the CalDAV client

use thiserror::Error;

/// Substrings that identify a UID-uniqueness rejection across the backends
/// we have seen. The set is closed on purpose: anything else is a real
/// error and must reach the run boundary.
const DUPLICATE_UID_MARKERS: [&str; 4] = [
    "no-uid-conflict",
    "uid already exists",
    "duplicate uid",
    "uid conflict",
];

#[derive(Error, Debug)]
pub enum CalDavError {
    #[error("CalDAV config is incomplete: base_url and username are required")]
    IncompleteConfig,

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("calendar not found: {0}")]
    CalendarNotFound(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("duplicate UID rejected by server: {0}")]
    DuplicateUid(String),

    #[error("malformed multistatus response: {0}")]
    Xml(String),

    #[error("calendar resource has no VEVENT")]
    MissingVevent,

    #[error("invalid datetime in calendar data: {0}")]
    InvalidDatetime(String),
}

impl CalDavError {
    /// Whether this error is a UID-uniqueness rejection that the engine's
    /// repair paths may absorb.
    pub fn is_duplicate_uid(&self) -> bool {
        match self {
            CalDavError::DuplicateUid(_) => true,
            CalDavError::Status { status, body, .. } => {
                let body = body.to_lowercase();
                *status == 409 && DUPLICATE_UID_MARKERS.iter().any(|m| body.contains(m))
            }
            _ => false,
        }
    }

    /// Classify an HTTP failure, promoting recognized UID rejections.
    pub fn from_status(status: u16, url: String, body: String) -> Self {
        let lowered = body.to_lowercase();
        if (status == 409 || status == 412)
            && DUPLICATE_UID_MARKERS.iter().any(|m| lowered.contains(m))
        {
            return CalDavError::DuplicateUid(body);
        }
        CalDavError::Status { status, url, body }
    }
}
