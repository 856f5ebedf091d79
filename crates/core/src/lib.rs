//! Avocado Core - Domain logic and models
//!
//! This crate contains pure domain logic with no I/O operations: the event
//! model, the staged-UID codec, the embedded task block, fingerprints, the
//! planner payload/change shapes, and the reconciler.

pub mod config;
pub mod fingerprint;
pub mod models;
pub mod planner;
pub mod reconciler;
pub mod task_block;
pub mod uid;

pub use fingerprint::{event_fingerprint, hash_text, snapshot_payload_hash};
pub use models::{
    CalendarInfo, CalendarRole, EventRecord, EventSource, ManagedRole, SyncOutcome, SyncStatus,
    Trigger, normalize_calendar_id, normalize_calendar_name, parse_iso_datetime, planning_window,
};
pub use uid::{collapse_nested_uid, prefix_depth, staged_uid};
