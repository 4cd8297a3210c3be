use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A backend the server can route to.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// xAI Grok. Also accepts "grok".
    #[serde(alias = "grok")]
    Xai,
    Groq,
    /// Google Gemini. Also accepts "google".
    #[serde(alias = "google")]
    Gemini,
    Ollama,
    /// OpenAI. Also accepts "chatgpt".
    #[serde(alias = "chatgpt")]
    Openai,
    Comfyui,
    Elevenlabs,
    Fal,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 8] = [
        Self::Xai,
        Self::Groq,
        Self::Gemini,
        Self::Ollama,
        Self::Openai,
        Self::Comfyui,
        Self::Elevenlabs,
        Self::Fal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xai => "xai",
            Self::Groq => "groq",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Openai => "openai",
            Self::Comfyui => "comfyui",
            Self::Elevenlabs => "elevenlabs",
            Self::Fal => "fal",
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Self::Xai | Self::Gemini | Self::Openai => &[Capability::Chat, Capability::Image],
            Self::Groq | Self::Ollama => &[Capability::Chat],
            Self::Comfyui | Self::Fal => &[Capability::Image],
            Self::Elevenlabs => &[Capability::Speech],
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider can be asked to do.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Image,
    Speech,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Image => "image",
            Self::Speech => "speech",
        }
    }
}
