use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::BridgeError;
use crate::providers::comfyui::ComfyUiSettings;
use crate::providers::elevenlabs::{self, ElevenLabsSettings};
use crate::providers::fal::{self, FalSettings};
use crate::providers::gemini::{self, GeminiSettings};
use crate::providers::grok::{self, GrokSettings};
use crate::providers::groq::{self, GroqSettings};
use crate::providers::ollama::{self, OllamaSettings};
use crate::providers::openai::{self, OpenAiSettings};

/// Env var naming an explicit config file.
pub const CONFIG_ENV: &str = "POLARAI_CONFIG";
/// Config file picked up from the working directory when `CONFIG_ENV` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "polarai.toml";

/// A provider credential. Never printed by `Debug`.
#[derive(Clone, Default, Deserialize)]
#[serde(from = "String")]
pub struct ApiKey(String);

impl From<String> for ApiKey {
    fn from(key: String) -> Self {
        Self::new(&key)
    }
}

impl ApiKey {
    pub fn new(key: &str) -> Self {
        Self(key.trim().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The key, or `MissingApiKey` naming the env var that would supply it.
    pub fn require(&self, provider: &str, env_var: &'static str) -> Result<&str, BridgeError> {
        if self.0.is_empty() {
            return Err(BridgeError::MissingApiKey {
                provider: provider.to_string(),
                env_var,
            });
        }
        Ok(&self.0)
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("ApiKey(<unset>)")
        } else {
            f.write_str("ApiKey([REDACTED])")
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Generated images land here.
    pub output_dir: PathBuf,
    /// Scratch space for synthesized audio.
    pub cache_dir: PathBuf,
    pub xai: GrokSettings,
    pub groq: GroqSettings,
    pub gemini: GeminiSettings,
    pub ollama: OllamaSettings,
    pub openai: OpenAiSettings,
    pub comfyui: ComfyUiSettings,
    pub elevenlabs: ElevenLabsSettings,
    pub fal: FalSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            cache_dir: env::temp_dir().join("polarai"),
            xai: GrokSettings::default(),
            groq: GroqSettings::default(),
            gemini: GeminiSettings::default(),
            ollama: OllamaSettings::default(),
            openai: OpenAiSettings::default(),
            comfyui: ComfyUiSettings::default(),
            elevenlabs: ElevenLabsSettings::default(),
            fal: FalSettings::default(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file (`$POLARAI_CONFIG` or `./polarai.toml`),
    /// then environment variables.
    pub fn load() -> Result<Self, BridgeError> {
        let path = match env::var_os(CONFIG_ENV) {
            Some(p) => Some(PathBuf::from(p)),
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.is_file().then_some(local)
            }
        };

        let mut config = match &path {
            Some(p) => {
                tracing::info!(path = %p.display(), "loading config file");
                Self::from_file(p)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, BridgeError> {
        toml::from_str(raw).map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))
    }

    /// Overlay environment values. Unset or blank variables leave the field alone.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let key = |name: &str| get(name).map(|v| ApiKey::new(&v));

        if let Some(k) = key(grok::API_KEY_ENV) {
            self.xai.api_key = k;
        }
        if let Some(k) = key(groq::API_KEY_ENV) {
            self.groq.api_key = k;
        }
        if let Some(k) = key(gemini::API_KEY_ENV).or_else(|| key(gemini::FALLBACK_API_KEY_ENV)) {
            self.gemini.api_key = k;
        }
        if let Some(k) = key(ollama::API_KEY_ENV) {
            self.ollama.api_key = k;
        }
        if let Some(k) = key(openai::API_KEY_ENV) {
            self.openai.api_key = k;
        }
        if let Some(k) = key(elevenlabs::API_KEY_ENV) {
            self.elevenlabs.api_key = k;
        }
        if let Some(k) = key(fal::API_KEY_ENV) {
            self.fal.api_key = k;
        }

        if let Some(host) = get("OLLAMA_HOST") {
            self.ollama.host = host;
        }
        if let Some(url) = get("COMFYUI_URL") {
            self.comfyui.base_url = url;
        }
        if let Some(dir) = get("POLARAI_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let urls = [
            ("xai.base_url", &self.xai.base_url),
            ("groq.url", &self.groq.url),
            ("gemini.base_url", &self.gemini.base_url),
            ("openai.base_url", &self.openai.base_url),
            ("comfyui.base_url", &self.comfyui.base_url),
            ("elevenlabs.base_url", &self.elevenlabs.base_url),
            ("fal.base_url", &self.fal.base_url),
        ];
        for (name, url) in urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(BridgeError::Config(format!(
                    "{name} must be an http(s) URL, got {url:?}"
                )));
            }
        }

        if self.comfyui.poll_interval_secs.is_nan() || self.comfyui.poll_interval_secs <= 0.0 {
            return Err(BridgeError::Config(
                "comfyui.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.comfyui.max_wait_secs.is_nan() || self.comfyui.max_wait_secs <= 0.0 {
            return Err(BridgeError::Config(
                "comfyui.max_wait_secs must be greater than 0".to_string(),
            ));
        }
        if self.xai.max_retry_delay_secs < self.xai.retry_base_delay_secs {
            return Err(BridgeError::Config(
                "xai.max_retry_delay_secs must not be below xai.retry_base_delay_secs".to_string(),
            ));
        }
        Ok(())
    }
}
