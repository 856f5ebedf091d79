//! Avocado Store - configuration file and embedded state database

pub mod config;
pub mod error;
pub mod state;

pub use config::ConfigStore;
pub use error::StoreError;
pub use state::{AuditEventRow, StateStore, SyncRunRow};
