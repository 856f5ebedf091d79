//! Avocado Sync - the three-layer reconciliation engine
//!
//! One [`SyncEngine::run_once`] call performs a full pass: managed-calendar
//! resolution, source classification, ingestion into the user layer,
//! replan gating, the planner exchange, change application under the policy
//! gates, and the stage mirror. The [`Scheduler`] drives runs one at a time.

pub mod audit;
mod engine;
mod ingest;
mod layers;
mod scheduler;

pub use engine::{RunStats, SyncEngine};
pub use layers::{
    ManagedCalendars, classify_calendars, immutable_calendar_ids, keyword_suggested_calendar_ids,
};
pub use scheduler::Scheduler;
