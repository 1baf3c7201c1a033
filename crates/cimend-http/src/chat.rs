//! OpenAI-compatible chat-completions provider.

use std::time::Duration;

use async_trait::async_trait;
use cimend_core::fix::parse_reply_text;
use cimend_core::provider::{
    ProposalRequest, Provider, ProviderError, ProviderReply, ProviderResult, SYSTEM_PROMPT,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::status::{provider_error, provider_transport_error};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Name used in audit records and logs.
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Empty for keyless servers.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            name: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
            temperature: 0.2,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the assistant text and parse it into a [`ProviderReply`].
fn reply_from_body(body: &str) -> ProviderResult<ProviderReply> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedResponse(format!("response body: {e}")))?;
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ProviderError::MalformedResponse("empty completion".into()))?;
    parse_reply_text(&text).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
}

pub struct ChatCompletionsProvider {
    config: ChatConfig,
    http: reqwest::Client,
    api_key: Option<String>,
}

impl ChatCompletionsProvider {
    pub fn new(config: ChatConfig, api_key: Option<String>) -> ProviderResult<Self> {
        if config.model.trim().is_empty() {
            return Err(ProviderError::Config("model must not be empty".into()));
        }
        if config.timeout_secs == 0 {
            return Err(ProviderError::Config(
                "timeout_secs must be greater than zero".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    /// Build a provider reading its key from `config.api_key_env`.
    pub fn from_env(config: ChatConfig) -> ProviderResult<Self> {
        let key = if config.api_key_env.is_empty() {
            None
        } else {
            Some(std::env::var(&config.api_key_env).map_err(|_| {
                ProviderError::Config(format!("{} is not set", config.api_key_env))
            })?)
        };
        Self::new(config, key)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Provider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip_all, fields(provider = %self.config.name, round = request.round, attempt = request.attempt))]
    async fn propose(&self, request: &ProposalRequest) -> ProviderResult<ProviderReply> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let limit_ms = self.config.timeout_secs * 1_000;
        let mut builder = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| provider_transport_error(e, limit_ms))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| provider_transport_error(e, limit_ms))?;
        if !status.is_success() {
            return Err(provider_error(status, &headers, &text));
        }

        let reply = reply_from_body(&text)?;
        debug!(edits = reply.edits.len(), confidence = reply.confidence, "completion parsed");
        Ok(reply)
    }
}
