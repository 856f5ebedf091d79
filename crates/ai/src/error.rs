//! Error types for the planner client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("planner is not configured")]
    NotConfigured,

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("planner endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("planner response is not valid JSON: {0}")]
    MalformedResponse(String),
}
