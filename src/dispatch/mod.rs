pub mod async_poll;
pub mod callback;
pub mod channel;
pub mod http;
pub mod registry;
pub mod retry;
pub mod stream;

use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;

/// One chat turn in the OpenAI-style `{role, content}` shape most providers share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
}

/// Some providers send `"content": null` on tool or refusal turns.
fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Provider-neutral text request used by the registry and the server.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub prompt: String,
    /// Provider model id; None selects the provider's configured default.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub deadline: Instant,
    /// Cooperative cancellation. Streaming backends return accumulated partial
    /// text instead of aborting.
    pub cancellation_token: Option<CancellationToken>,
}

impl TextRequest {
    /// Messages in `{system?, user}` order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = self.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(sys));
        }
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }
}

/// Provider-neutral text result.
#[derive(Debug)]
pub struct TextReply {
    pub text: String,
    pub model: String,
    pub provider: String,
    /// True if the text was truncated due to cancellation or the deadline.
    pub partial: bool,
}

/// Remote id correlating a submission with its follow-up polls
/// (ComfyUI prompt id, OpenAI batch/run id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationHandle(String);

impl OperationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
