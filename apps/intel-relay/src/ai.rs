//! AI completion collaborator.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const NO_API_KEY_NOTICE: &str =
    "OpenAI API key not configured. Response is generated locally.";

const SYSTEM_PROMPT: &str = "You are a senior business intelligence analyst. \
Given a company identifier, produce exactly 3 concise, actionable insights, each with a \
finding, a likely root cause, a recommended action and a priority (High/Medium/Low).";

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("completion response had no content")]
    EmptyResponse,
}

impl AiError {
    pub fn is_timeout(&self) -> bool {
        match self {
            AiError::Timeout(_) => true,
            AiError::Http(err) => err.is_timeout(),
            _ => false,
        }
    }
}

/// Free-text answer for a prompt.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, entity_key: &str) -> Result<String, AiError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, AiError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl Completion for OpenAiClient {
    async fn complete(&self, entity_key: &str) -> Result<String, AiError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Ok(NO_API_KEY_NOTICE.to_string());
        };
        let prompt = format!(
            "Company: {entity_key}\nAnalysis period: last 30 days\n\
             Provide 3 high-impact business insights."
        );
        let body = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: 500,
            temperature: 0.7,
        };
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        debug!(entity = entity_key, model = %self.config.model, "requesting completion");

        let request = self.http.post(url).bearer_auth(api_key).json(&body).send();
        let resp = match tokio::time::timeout(self.config.timeout, request).await {
            Ok(resp) => resp?,
            Err(_) => return Err(AiError::Timeout(self.config.timeout)),
        };
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ChatResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(AiError::EmptyResponse)
    }
}
