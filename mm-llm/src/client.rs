use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const COMPLETION_MAX_TOKENS: u32 = 100;
const COMPLETION_TEMPERATURE: f32 = 0.9;
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat-completions client for a single OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ChatClient {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One system prompt, one user turn, one short completion back.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn complete(&self, system_prompt: &str, user_turn: &str) -> Result<String> {
        if user_turn.trim().is_empty() {
            return Err(LlmError::InvalidInput("empty user turn".to_string()));
        }

        let req = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: user_turn.to_string(),
                },
            ],
            max_tokens: COMPLETION_MAX_TOKENS,
            temperature: COMPLETION_TEMPERATURE,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "chat completion status={status} body={body}"
            )));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseFormat("response carried no choices".to_string()))?;
        Ok(choice.message.content.trim().to_string())
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionChoiceMessage {
    #[serde(default)]
    content: String,
}
