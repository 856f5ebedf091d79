//! OpenAI-compatible chat client

use async_trait::async_trait;
use avocado_core::config::AiConfig;
use avocado_core::planner::ChatMessage;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PlannerError;
use crate::{PlannerClient, PlannerConnector, PlannerResponse};

static JSON_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("json block pattern")
});

/// Pull the first JSON object out of a model reply that may be wrapped in
/// fenced code or prose.
pub fn extract_json_payload(content: &str) -> Result<String, PlannerError> {
    let text = content.trim();
    if text.starts_with('{') && text.ends_with('}') {
        return Ok(text.to_string());
    }
    if let Some(captures) = JSON_BLOCK_RE.captures(text) {
        if let Some(block) = captures.get(1) {
            return Ok(block.as_str().to_string());
        }
    }
    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            return Ok(text[start..=end].to_string());
        }
    }
    Err(PlannerError::MalformedResponse(
        "response does not contain a JSON object".to_string(),
    ))
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct OpenAiPlanner {
    http: reqwest::Client,
    config: AiConfig,
}

impl OpenAiPlanner {
    pub fn new(config: &AiConfig) -> Self {
        OpenAiPlanner {
            http: reqwest::Client::new(),
            config: config.clone(),
        }
    }

    fn chat_endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn models_endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match base.strip_suffix("/chat/completions") {
            Some(root) => format!("{root}/models"),
            None => format!("{base}/models"),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds.max(1))
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, PlannerError> {
        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.2,
            "response_format": {"type": "json_object"},
        });
        let response = self
            .http
            .post(self.chat_endpoint())
            .bearer_auth(&self.config.api_key)
            .timeout(self.timeout())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlannerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ChatCompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| PlannerError::MalformedResponse("no choices in response".to_string()))
    }
}

#[async_trait]
impl PlannerClient for OpenAiPlanner {
    fn is_configured(&self) -> bool {
        !self.config.base_url.trim().is_empty()
            && !self.config.api_key.trim().is_empty()
            && !self.config.model.trim().is_empty()
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<PlannerResponse, PlannerError> {
        if !self.is_configured() {
            return Ok(PlannerResponse::default());
        }
        let content = self.chat(messages).await?;
        let json_text = extract_json_payload(&content)?;
        let value: serde_json::Value = serde_json::from_str(&json_text)
            .map_err(|e| PlannerError::MalformedResponse(e.to_string()))?;
        let changes = match value.get("changes") {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => {
                warn!("planner response carries no changes array");
                Vec::new()
            }
        };
        debug!(count = changes.len(), "planner returned changes");
        Ok(PlannerResponse { changes })
    }

    async fn test(&self) -> (bool, String) {
        if !self.is_configured() {
            return (false, "AI endpoint is not configured".to_string());
        }
        let probe = vec![
            ChatMessage::new("system", "Reply with the single word: ok"),
            ChatMessage::new("user", "ping"),
        ];
        match self.chat(&probe).await {
            Ok(content) => {
                let preview: String = content.chars().take(80).collect();
                (true, format!("model responded: {preview}"))
            }
            Err(e) => (false, e.to_string()),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, PlannerError> {
        if self.config.base_url.trim().is_empty() {
            return Err(PlannerError::NotConfigured);
        }
        let response = self
            .http
            .get(self.models_endpoint())
            .bearer_auth(&self.config.api_key)
            .timeout(self.timeout())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlannerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ModelListResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|entry| entry.id).collect())
    }
}

/// Default connector handing out one HTTP planner per run.
#[derive(Debug, Default, Clone)]
pub struct OpenAiPlannerConnector;

impl PlannerConnector for OpenAiPlannerConnector {
    fn connect(&self, config: &AiConfig) -> Arc<dyn PlannerClient> {
        Arc::new(OpenAiPlanner::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_object() {
        let content = r#"{"changes": []}"#;
        assert_eq!(extract_json_payload(content).unwrap(), content);
    }

    #[test]
    fn test_extract_fenced_object() {
        let content = "Here you go:\n```json\n{\"changes\": [{\"uid\": \"a\"}]}\n```\nanything else?";
        let extracted = extract_json_payload(content).unwrap();
        assert!(extracted.starts_with('{'));
        assert!(extracted.contains("changes"));
    }

    #[test]
    fn test_extract_embedded_object() {
        let content = "The plan is {\"changes\": []} as requested.";
        assert_eq!(extract_json_payload(content).unwrap(), r#"{"changes": []}"#);
    }

    #[test]
    fn test_extract_failure() {
        assert!(extract_json_payload("no json here").is_err());
    }

    #[test]
    fn test_endpoints() {
        let mut config = AiConfig::default();
        config.base_url = "https://api.example.com/v1/".to_string();
        let planner = OpenAiPlanner::new(&config);
        assert_eq!(
            planner.chat_endpoint(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(planner.models_endpoint(), "https://api.example.com/v1/models");

        config.base_url = "https://api.example.com/v1/chat/completions".to_string();
        let planner = OpenAiPlanner::new(&config);
        assert_eq!(
            planner.chat_endpoint(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(planner.models_endpoint(), "https://api.example.com/v1/models");
    }

    #[test]
    fn test_is_configured() {
        let mut config = AiConfig::default();
        let planner = OpenAiPlanner::new(&config);
        assert!(!planner.is_configured());
        config.base_url = "https://api.example.com/v1".to_string();
        config.api_key = "key".to_string();
        let planner = OpenAiPlanner::new(&config);
        assert!(planner.is_configured());
    }
}
