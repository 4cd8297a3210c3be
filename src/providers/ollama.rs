use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ApiKey;
use crate::dispatch::http::{HttpDispatch, RequestSpec};
use crate::dispatch::stream::{StreamOutcome, StreamStep, read_ndjson};
use crate::dispatch::{ChatMessage, TextReply, TextRequest};
use crate::error::BridgeError;
use crate::providers::join_url;

pub const PROVIDER: &str = "ollama";
pub const API_KEY_ENV: &str = "OLLAMA_API_KEY";

const LOCAL_HOST: &str = "http://localhost:11434";
const TURBO_HOST: &str = "https://ollama.com";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OllamaMode {
    /// Self-hosted server, no auth.
    #[default]
    Local,
    /// Hosted ollama.com, API key required.
    Turbo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub mode: OllamaMode,
    /// Empty picks the mode's default host.
    pub host: String,
    pub api_key: ApiKey,
    pub api_key_header_name: String,
    pub api_key_header_prefix: String,
    pub timeout_secs: u64,
    pub model: String,
    /// Stream tokens for the `chat` tool instead of waiting for the whole reply.
    pub stream: bool,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            mode: OllamaMode::Local,
            host: String::new(),
            api_key: ApiKey::default(),
            api_key_header_name: "Authorization".to_string(),
            api_key_header_prefix: "Bearer ".to_string(),
            timeout_secs: 180,
            model: "gpt-oss:120b".to_string(),
            stream: true,
        }
    }
}

impl OllamaSettings {
    pub fn host(&self) -> &str {
        if !self.host.is_empty() {
            return &self.host;
        }
        match self.mode {
            OllamaMode::Local => LOCAL_HOST,
            OllamaMode::Turbo => TURBO_HOST,
        }
    }

    /// Auth header for Turbo mode. Local mode never sends one.
    fn auth_header(&self) -> Result<Option<(String, String)>, BridgeError> {
        match self.mode {
            OllamaMode::Local => Ok(None),
            OllamaMode::Turbo => {
                let key = self.api_key.require(PROVIDER, API_KEY_ENV)?;
                Ok(Some((
                    self.api_key_header_name.clone(),
                    format!("{}{key}", self.api_key_header_prefix),
                )))
            }
        }
    }
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// One `/api/chat` reply object; streaming sends one per line.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaChatChunk {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
}

/// Map one NDJSON line to a stream step. Lines that are not chunks are skipped.
pub fn parse_chunk_line(line: &str) -> StreamStep {
    match serde_json::from_str::<OllamaChatChunk>(line) {
        Ok(chunk) => StreamStep {
            delta: chunk.message.map(|m| m.content).filter(|c| !c.is_empty()),
            done: chunk.done,
        },
        Err(e) => {
            tracing::debug!(provider = PROVIDER, "skipping unparseable stream line: {e}");
            StreamStep::skip()
        }
    }
}

pub struct OllamaClient {
    settings: OllamaSettings,
    http: Arc<HttpDispatch>,
}

impl OllamaClient {
    pub fn new(settings: OllamaSettings, http: Arc<HttpDispatch>) -> Self {
        Self { settings, http }
    }

    fn chat_spec(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<RequestSpec, BridgeError> {
        if model.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("model cannot be empty".to_string()));
        }
        let body = serde_json::to_value(OllamaChatRequest {
            model,
            messages,
            stream,
        })
        .map_err(|e| BridgeError::InvalidRequest(format!("unserializable chat request: {e}")))?;

        let mut spec = RequestSpec::post_json(join_url(self.settings.host(), "/api/chat"), body)
            .timeout(Duration::from_secs(self.settings.timeout_secs));
        if let Some((name, value)) = self.settings.auth_header()? {
            spec = spec.header(name, value);
        }
        Ok(spec)
    }

    /// Non-streaming chat; returns the reply content.
    pub async fn chat_once(&self, model: &str, messages: &[ChatMessage]) -> Result<String, BridgeError> {
        let spec = self.chat_spec(model, messages, false)?;
        let reply = self.http.send_ok(PROVIDER, &spec).await?;
        if reply.body.iter().all(u8::is_ascii_whitespace) {
            return Err(BridgeError::decode(PROVIDER, "empty response"));
        }

        let chunk: OllamaChatChunk = reply.json(PROVIDER)?;
        chunk
            .message
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BridgeError::decode(PROVIDER, "reply content is empty"))
    }

    /// Streaming chat. `on_token` sees each token; the accumulated text is returned
    /// once a chunk reports `done` or the body ends.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<StreamOutcome, BridgeError> {
        let spec = self.chat_spec(model, messages, true)?;
        let response = self.http.open(PROVIDER, &spec).await?;
        read_ndjson(
            PROVIDER,
            response,
            deadline,
            cancel,
            |line| Ok(parse_chunk_line(line)),
            on_token,
        )
        .await
    }

    pub async fn complete(&self, req: &TextRequest) -> Result<TextReply, BridgeError> {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone());
        let messages = req.messages();

        if !self.settings.stream {
            let budget = req.deadline.saturating_duration_since(Instant::now());
            let text = tokio::time::timeout(budget, self.chat_once(&model, &messages))
                .await
                .map_err(|_| BridgeError::Timeout {
                    provider: PROVIDER.to_string(),
                    waited_ms: budget.as_millis() as u64,
                })??;
            return Ok(TextReply {
                text,
                model,
                provider: PROVIDER.to_string(),
                partial: false,
            });
        }

        let outcome = self
            .chat_stream(
                &model,
                &messages,
                Some(req.deadline),
                req.cancellation_token.as_ref(),
                &mut |_: &str| {},
            )
            .await?;
        if outcome.text.is_empty() {
            return Err(BridgeError::decode(PROVIDER, "reply content is empty"));
        }
        Ok(TextReply {
            text: outcome.text,
            model,
            provider: PROVIDER.to_string(),
            partial: outcome.partial,
        })
    }
}
