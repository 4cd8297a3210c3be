use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::ApiKey;
use crate::dispatch::http::{HttpDispatch, RequestSpec};
use crate::dispatch::{ChatMessage, TextReply, TextRequest};
use crate::error::BridgeError;

pub const PROVIDER: &str = "groq";
pub const API_KEY_ENV: &str = "GROQ_API_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroqSettings {
    pub api_key: ApiKey,
    pub url: String,
    pub model: String,
    pub temperature: f64,
}

impl Default for GroqSettings {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            model: "openai/gpt-oss-120b".to_string(),
            temperature: 0.2,
        }
    }
}

#[derive(Serialize)]
struct GroqChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct GroqChoice {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct GroqChatResponse {
    #[serde(default)]
    choices: Vec<GroqChoice>,
}

/// OpenAI-compatible chat completions against Groq.
pub struct GroqClient {
    settings: GroqSettings,
    http: Arc<HttpDispatch>,
}

impl GroqClient {
    pub fn new(settings: GroqSettings, http: Arc<HttpDispatch>) -> Self {
        Self { settings, http }
    }

    /// Send one message with the given role.
    pub async fn send(&self, role: &str, prompt: &str) -> Result<String, BridgeError> {
        self.chat(&[ChatMessage::new(role, prompt)]).await
    }

    /// Send a whole conversation and return the trimmed reply.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, BridgeError> {
        self.chat_with(messages, &self.settings.model, self.settings.temperature, None, None)
            .await
    }

    async fn chat_with(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: Option<u64>,
        deadline: Option<Instant>,
    ) -> Result<String, BridgeError> {
        let api_key = self.settings.api_key.require(PROVIDER, API_KEY_ENV)?;
        if messages.is_empty() {
            return Err(BridgeError::InvalidRequest("no messages to send".to_string()));
        }

        let body = serde_json::to_value(GroqChatRequest {
            model,
            messages,
            temperature,
            max_tokens,
        })
        .map_err(|e| BridgeError::InvalidRequest(format!("unserializable chat request: {e}")))?;

        let mut spec = RequestSpec::post_json(&self.settings.url, body).bearer(api_key);
        if let Some(deadline) = deadline {
            spec = spec.within(deadline);
        }

        let reply = self.http.send_ok(PROVIDER, &spec).await?;
        let parsed: GroqChatResponse = reply.json(PROVIDER)?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                BridgeError::decode(
                    PROVIDER,
                    format!("reply content is empty; raw: {}", reply.text()),
                )
            })
    }

    pub async fn complete(&self, req: &TextRequest) -> Result<TextReply, BridgeError> {
        let model = req.model.as_deref().unwrap_or(&self.settings.model);
        let text = self
            .chat_with(
                &req.messages(),
                model,
                req.temperature.unwrap_or(self.settings.temperature),
                req.max_tokens,
                Some(req.deadline),
            )
            .await?;
        Ok(TextReply {
            text,
            model: model.to_string(),
            provider: PROVIDER.to_string(),
            partial: false,
        })
    }
}
