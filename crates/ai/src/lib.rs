//! Avocado AI - planner client
//!
//! Talks to any OpenAI-compatible chat endpoint. The planner's output is
//! untrusted: the client only guarantees a `changes` array of raw JSON
//! values; normalization and policy checks happen in the core crate.

mod client;
pub mod error;

pub use client::{OpenAiPlanner, OpenAiPlannerConnector, extract_json_payload};
pub use error::PlannerError;

use async_trait::async_trait;
use avocado_core::config::AiConfig;
use avocado_core::planner::ChatMessage;
use std::sync::Arc;

/// Raw planner response: a `changes` array, nothing more is promised.
#[derive(Debug, Clone, Default)]
pub struct PlannerResponse {
    pub changes: Vec<serde_json::Value>,
}

#[async_trait]
pub trait PlannerClient: Send + Sync {
    /// Whether base_url, api_key, and model are all present.
    fn is_configured(&self) -> bool;

    /// Run one planning exchange.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<PlannerResponse, PlannerError>;

    /// Cheap connectivity probe; returns (ok, human-readable message).
    async fn test(&self) -> (bool, String);

    /// Model ids advertised by the endpoint.
    async fn list_models(&self) -> Result<Vec<String>, PlannerError>;
}

/// Builds a planner client per run from the current configuration.
pub trait PlannerConnector: Send + Sync {
    fn connect(&self, config: &AiConfig) -> Arc<dyn PlannerClient>;
}
