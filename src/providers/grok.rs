use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ApiKey;
use crate::dispatch::http::{HttpDispatch, HttpReply, RequestSpec};
use crate::dispatch::retry::{Retried, RetryPolicy};
use crate::dispatch::{ChatMessage, TextReply, TextRequest};
use crate::error::BridgeError;
use crate::media::ImageData;
use crate::providers::{join_url, secs};

pub const PROVIDER: &str = "xai";
pub const API_KEY_ENV: &str = "XAI_API_KEY";

/// Model ids the xAI console lists. Any other id string is passed through.
pub mod models {
    pub const GROK_4_FAST_REASONING: &str = "grok-4-fast-reasoning";
    pub const GROK_4_FAST_NON_REASONING: &str = "grok-4-fast-non-reasoning";
    pub const GROK_4_0709: &str = "grok-4-0709";
    pub const GROK_3: &str = "grok-3";
    pub const GROK_3_MINI: &str = "grok-3-mini";
    pub const GROK_2_1212_US_EAST_1: &str = "grok-2-1212us-east-1";
    pub const GROK_2_1212_EU_WEST_1: &str = "grok-2-1212eu-west-1";
    pub const GROK_2_VISION_1212_US_EAST_1: &str = "grok-2-vision-1212us-east-1";
    pub const GROK_2_VISION_1212_EU_WEST_1: &str = "grok-2-vision-1212eu-west-1";
    pub const GROK_2_IMAGE_1212: &str = "grok-2-image-1212";
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrokSettings {
    pub api_key: ApiKey,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_secs: f64,
    pub max_retry_delay_secs: f64,
    pub min_delay_between_requests_secs: f64,
}

impl Default for GrokSettings {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            base_url: "https://api.x.ai/v1".to_string(),
            model: models::GROK_4_FAST_REASONING.to_string(),
            image_model: models::GROK_2_IMAGE_1212.to_string(),
            request_timeout_secs: 120,
            max_retries: 3,
            retry_base_delay_secs: 1.0,
            max_retry_delay_secs: 30.0,
            min_delay_between_requests_secs: 0.25,
        }
    }
}

impl GrokSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: secs(self.retry_base_delay_secs),
            max_delay: secs(self.max_retry_delay_secs),
            min_delay_between_requests: secs(self.min_delay_between_requests_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GrokChatRequest {
    /// Empty selects the configured default model.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u64,
    pub stream: bool,
}

impl GrokChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: String::new(),
            messages,
            temperature: 0.7,
            max_tokens: 1024,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrokChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrokChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<GrokChatChoice>,
}

impl GrokChatResponse {
    /// Content of the first choice, if any.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GrokImageRequest {
    /// Empty selects the configured image model.
    pub model: String,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// `b64_json` or `url`.
    pub response_format: String,
    pub n: u32,
}

impl GrokImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            model: String::new(),
            prompt: prompt.into(),
            width: 1024,
            height: 1024,
            format: "png".to_string(),
            response_format: "b64_json".to_string(),
            n: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GrokImageData {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrokImageResponse {
    #[serde(default)]
    data: Vec<GrokImageData>,
}

/// xAI chat and image generation, with throttling retries on every call.
pub struct GrokClient {
    settings: GrokSettings,
    http: Arc<HttpDispatch>,
}

impl GrokClient {
    pub fn new(settings: GrokSettings, http: Arc<HttpDispatch>) -> Self {
        Self { settings, http }
    }

    pub fn settings(&self) -> &GrokSettings {
        &self.settings
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Retried<HttpReply>, BridgeError> {
        let api_key = self.settings.api_key.require(PROVIDER, API_KEY_ENV)?;
        let spec = RequestSpec::post_json(join_url(&self.settings.base_url, path), body)
            .bearer(api_key)
            .timeout(self.settings.request_timeout());
        self.http
            .send_with_retry(PROVIDER, &spec, &self.settings.retry_policy())
            .await
    }

    pub async fn chat(&self, mut request: GrokChatRequest) -> Result<GrokChatResponse, BridgeError> {
        if request.model.is_empty() {
            request.model = self.settings.model.clone();
        }
        let body = serde_json::to_value(&request)
            .map_err(|e| BridgeError::InvalidRequest(format!("unserializable chat request: {e}")))?;

        let reply = self.post("/chat/completions", body).await?;
        if reply.retries() > 0 {
            tracing::info!(provider = PROVIDER, retries = reply.retries(), "chat succeeded after retries");
        }
        reply.value.json(PROVIDER)
    }

    /// Generate one image. Inline base64 is preferred; a URL-only reply is downloaded.
    pub async fn generate_image(&self, mut request: GrokImageRequest) -> Result<ImageData, BridgeError> {
        if request.prompt.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("prompt must not be empty".to_string()));
        }
        if request.model.is_empty() {
            request.model = self.settings.image_model.clone();
        }
        let body = serde_json::to_value(&request)
            .map_err(|e| BridgeError::InvalidRequest(format!("unserializable image request: {e}")))?;

        let reply = self.post("/images/generations", body).await?;
        let parsed: GrokImageResponse = reply.value.json(PROVIDER)?;
        let first = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::decode(PROVIDER, "invalid image response"))?;

        match (first.b64_json, first.url) {
            (Some(b64), _) if !b64.is_empty() => ImageData::from_base64(PROVIDER, &b64),
            (_, Some(url)) if !url.is_empty() => {
                tracing::debug!(provider = PROVIDER, url = %url, "downloading generated image");
                let bytes = self
                    .http
                    .get_bytes(PROVIDER, &url, self.settings.request_timeout())
                    .await?;
                ImageData::from_bytes(PROVIDER, bytes)
            }
            _ => Err(BridgeError::decode(PROVIDER, "invalid image response (no data)")),
        }
    }

    /// Provider-neutral chat used by the registry.
    pub async fn complete(&self, req: &TextRequest) -> Result<TextReply, BridgeError> {
        let mut chat = GrokChatRequest::new(req.messages());
        if let Some(model) = &req.model {
            chat.model = model.clone();
        }
        if let Some(t) = req.temperature {
            chat.temperature = t;
        }
        if let Some(m) = req.max_tokens {
            chat.max_tokens = m;
        }

        let remaining = req.deadline.saturating_duration_since(Instant::now());
        let response = tokio::time::timeout(remaining, self.chat(chat))
            .await
            .map_err(|_| BridgeError::Timeout {
                provider: PROVIDER.to_string(),
                waited_ms: remaining.as_millis() as u64,
            })??;

        let text = response
            .text()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BridgeError::decode(PROVIDER, "reply content is empty"))?
            .to_string();

        Ok(TextReply {
            text,
            model: response.model,
            provider: PROVIDER.to_string(),
            partial: false,
        })
    }
}
