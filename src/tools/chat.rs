use schemars::JsonSchema;
use serde::Deserialize;

use crate::tools::enums::ProviderKind;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ChatRequest {
    /// Backend to ask: xai, groq, gemini, ollama or openai (defaults to xai).
    pub provider: Option<ProviderKind>,
    /// Provider model id. Omit to use the provider's configured default.
    pub model: Option<String>,
    /// The prompt to send.
    pub prompt: String,
    /// System prompt to set persona/behavior.
    pub system_prompt: Option<String>,
    /// Sampling temperature, 0.0 to 2.0.
    pub temperature: Option<f64>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u64>,
}

pub const DEFAULT_PROVIDER: ProviderKind = ProviderKind::Xai;

impl ChatRequest {
    pub fn provider_or_default(&self) -> ProviderKind {
        self.provider.unwrap_or(DEFAULT_PROVIDER)
    }

    /// The requested model, with blank strings treated as absent.
    pub fn model(&self) -> Option<String> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
    }
}
