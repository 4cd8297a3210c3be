use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::dispatch::callback::{Progress, ProgressFn};
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::{TextReply, TextRequest};
use crate::error::BridgeError;
use crate::media::ImageData;
use crate::providers::comfyui::{ComfyUiClient, ComfyUiRequest, LoraEntry};
use crate::providers::elevenlabs::ElevenLabsClient;
use crate::providers::fal::{FalClient, FalImageRequest, FalImageSize};
use crate::providers::gemini::GeminiClient;
use crate::providers::grok::{GrokClient, GrokImageRequest};
use crate::providers::groq::GroqClient;
use crate::providers::ollama::{OllamaClient, OllamaMode};
use crate::providers::openai::OpenAiClient;
use crate::tools::enums::{Capability, ProviderKind};

/// Max concurrent chat requests per instance.
const TEXT_MAX_CONCURRENT: usize = 8;

/// Max concurrent image jobs per instance.
/// Low limit since a local ComfyUI renders one graph at a time anyway.
const IMAGE_MAX_CONCURRENT: usize = 2;

/// Max concurrent speech syntheses per instance.
const SPEECH_MAX_CONCURRENT: usize = 4;

/// One row of `listproviders`.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub kind: ProviderKind,
    pub configured: bool,
    /// Env var that supplies the key; None for keyless local backends.
    pub key_env: Option<&'static str>,
    pub capabilities: &'static [Capability],
}

/// Provider-neutral image request. Fields a backend cannot use are ignored.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub seed: Option<i64>,
    pub checkpoint: Option<String>,
    pub loras: Vec<String>,
    pub endpoint: Option<String>,
    pub input_images: Vec<PathBuf>,
    pub deadline: Instant,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>, deadline: Instant) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: None,
            height: None,
            steps: None,
            seed: None,
            checkpoint: None,
            loras: Vec::new(),
            endpoint: None,
            input_images: Vec::new(),
            deadline,
        }
    }

    fn to_comfyui(&self) -> ComfyUiRequest {
        let defaults = ComfyUiRequest::default();
        ComfyUiRequest {
            positive_prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone().unwrap_or_default(),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            steps: self.steps.unwrap_or(defaults.steps),
            seed: self.seed.unwrap_or(defaults.seed),
            checkpoint: self.checkpoint.clone().unwrap_or_default(),
            loras: self
                .loras
                .iter()
                .map(|name| LoraEntry {
                    lora_name: name.clone(),
                    model_strength: 1.0,
                    clip_strength: 1.0,
                })
                .collect(),
            ..defaults
        }
    }

    fn to_fal(&self) -> FalImageRequest {
        let image_size = match (self.width, self.height) {
            (None, None) => None,
            (w, h) => Some(FalImageSize {
                width: w.or(h).unwrap_or(1024),
                height: h.or(w).unwrap_or(1024),
            }),
        };
        FalImageRequest {
            negative_prompt: self.negative_prompt.clone().filter(|n| !n.trim().is_empty()),
            image_size,
            num_inference_steps: self.steps,
            seed: self.seed.filter(|s| *s >= 0),
            ..FalImageRequest::new(self.prompt.clone())
        }
    }
}

/// A generated image written to the output directory.
#[derive(Debug, Clone)]
pub struct SavedImage {
    pub path: PathBuf,
    pub provider: &'static str,
    /// Model, checkpoint or endpoint that rendered the image.
    pub model: String,
    pub mime_type: &'static str,
    pub bytes: usize,
}

pub struct Registry {
    grok: GrokClient,
    groq: GroqClient,
    gemini: GeminiClient,
    ollama: OllamaClient,
    openai: OpenAiClient,
    comfyui: ComfyUiClient,
    elevenlabs: ElevenLabsClient,
    fal: FalClient,
    config: Config,
    text_semaphore: Semaphore,
    image_semaphore: Semaphore,
    speech_semaphore: Semaphore,
}

impl Registry {
    pub fn from_config(config: Config) -> Self {
        let http = Arc::new(HttpDispatch::new());
        Self {
            grok: GrokClient::new(config.xai.clone(), Arc::clone(&http)),
            groq: GroqClient::new(config.groq.clone(), Arc::clone(&http)),
            gemini: GeminiClient::new(config.gemini.clone(), Arc::clone(&http)),
            ollama: OllamaClient::new(config.ollama.clone(), Arc::clone(&http)),
            openai: OpenAiClient::new(config.openai.clone(), Arc::clone(&http)),
            comfyui: ComfyUiClient::new(config.comfyui.clone(), Arc::clone(&http)),
            elevenlabs: ElevenLabsClient::new(config.elevenlabs.clone(), Arc::clone(&http)),
            fal: FalClient::new(config.fal.clone(), http),
            config,
            text_semaphore: Semaphore::new(TEXT_MAX_CONCURRENT),
            image_semaphore: Semaphore::new(IMAGE_MAX_CONCURRENT),
            speech_semaphore: Semaphore::new(SPEECH_MAX_CONCURRENT),
        }
    }

    /// Returns the number of text semaphore permits (for testing).
    pub fn text_semaphore_permits(&self) -> usize {
        self.text_semaphore.available_permits()
    }

    /// Returns the number of image semaphore permits (for testing).
    pub fn image_semaphore_permits(&self) -> usize {
        self.image_semaphore.available_permits()
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    pub fn openai(&self) -> &OpenAiClient {
        &self.openai
    }

    pub fn comfyui(&self) -> &ComfyUiClient {
        &self.comfyui
    }

    /// Whether `kind` has what it needs to be called. Local backends need no key.
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        let c = &self.config;
        match kind {
            ProviderKind::Xai => !c.xai.api_key.is_empty(),
            ProviderKind::Groq => !c.groq.api_key.is_empty(),
            ProviderKind::Gemini => !c.gemini.api_key.is_empty(),
            ProviderKind::Ollama => {
                c.ollama.mode == OllamaMode::Local || !c.ollama.api_key.is_empty()
            }
            ProviderKind::Openai => !c.openai.api_key.is_empty(),
            ProviderKind::Comfyui => true,
            ProviderKind::Elevenlabs => !c.elevenlabs.api_key.is_empty(),
            ProviderKind::Fal => !c.fal.api_key.is_empty(),
        }
    }

    pub fn list_providers(&self) -> Vec<ProviderStatus> {
        ProviderKind::ALL
            .iter()
            .map(|&kind| ProviderStatus {
                kind,
                configured: self.is_configured(kind),
                key_env: key_env(kind, &self.config),
                capabilities: kind.capabilities(),
            })
            .collect()
    }

    /// Acquire a semaphore permit with a deadline-aware timeout.
    /// Returns Timeout if the deadline expires before a permit is available.
    async fn acquire_with_deadline<'a>(
        semaphore: &'a Semaphore,
        deadline: Instant,
        kind: ProviderKind,
    ) -> Result<tokio::sync::SemaphorePermit<'a>, BridgeError> {
        let timeout_err = |waited_ms: u64| BridgeError::Timeout {
            provider: kind.as_str().to_string(),
            waited_ms,
        };
        let timeout = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| timeout_err(0))?;

        tokio::time::timeout(timeout, semaphore.acquire())
            .await
            .map_err(|_| timeout_err(timeout.as_millis() as u64))?
            .map_err(|_| BridgeError::InvalidRequest("semaphore closed".to_string()))
    }

    fn require(kind: ProviderKind, capability: Capability) -> Result<(), BridgeError> {
        if kind.supports(capability) {
            return Ok(());
        }
        Err(unsupported(kind, capability))
    }

    pub async fn chat(&self, kind: ProviderKind, req: &TextRequest) -> Result<TextReply, BridgeError> {
        Self::require(kind, Capability::Chat)?;
        let _permit = Self::acquire_with_deadline(&self.text_semaphore, req.deadline, kind).await?;

        let start = Instant::now();
        tracing::info!(provider = kind.as_str(), model = ?req.model, "dispatching chat");
        let reply = match kind {
            ProviderKind::Xai => self.grok.complete(req).await,
            ProviderKind::Groq => self.groq.complete(req).await,
            ProviderKind::Gemini => self.gemini.complete(req).await,
            ProviderKind::Ollama => self.ollama.complete(req).await,
            ProviderKind::Openai => self.openai.complete(req).await,
            ProviderKind::Comfyui | ProviderKind::Elevenlabs | ProviderKind::Fal => {
                Err(unsupported(kind, Capability::Chat))
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &reply {
            Ok(r) => tracing::info!(
                provider = kind.as_str(),
                model = r.model.as_str(),
                partial = r.partial,
                elapsed_ms,
                "chat finished"
            ),
            Err(e) => tracing::warn!(provider = kind.as_str(), elapsed_ms, "chat failed: {e}"),
        }
        reply
    }

    /// Generate one image and write it to the output directory.
    pub async fn generate_image(
        &self,
        kind: ProviderKind,
        req: &ImageRequest,
    ) -> Result<SavedImage, BridgeError> {
        Self::require(kind, Capability::Image)?;
        let _permit = Self::acquire_with_deadline(&self.image_semaphore, req.deadline, kind).await?;

        let budget = req.deadline.saturating_duration_since(Instant::now());
        let image = tokio::time::timeout(budget, self.render(kind, req))
            .await
            .map_err(|_| {
                if kind == ProviderKind::Comfyui {
                    self.comfyui.cancel_current();
                }
                BridgeError::Timeout {
                    provider: kind.as_str().to_string(),
                    waited_ms: budget.as_millis() as u64,
                }
            })??;

        let stem = format!("{}-{}", kind.as_str(), unix_millis());
        let path = image.persist(&self.config.output_dir, &stem).await?;
        tracing::info!(provider = kind.as_str(), path = %path.display(), "image saved");
        Ok(SavedImage {
            path,
            provider: kind.as_str(),
            model: self.image_model(kind, req),
            mime_type: image.mime_type,
            bytes: image.bytes.len(),
        })
    }

    fn image_model(&self, kind: ProviderKind, req: &ImageRequest) -> String {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        let c = &self.config;
        match kind {
            ProviderKind::Xai => c.xai.image_model.clone(),
            ProviderKind::Gemini => c.gemini.image_model.clone(),
            ProviderKind::Openai => c.openai.image_model.clone(),
            ProviderKind::Comfyui => {
                non_empty(&req.checkpoint).unwrap_or_else(|| c.comfyui.checkpoint.clone())
            }
            ProviderKind::Fal => non_empty(&req.endpoint).unwrap_or_else(|| c.fal.image_endpoint.clone()),
            ProviderKind::Groq | ProviderKind::Ollama | ProviderKind::Elevenlabs => String::new(),
        }
    }

    async fn render(&self, kind: ProviderKind, req: &ImageRequest) -> Result<ImageData, BridgeError> {
        match kind {
            ProviderKind::Xai => {
                let mut image = GrokImageRequest::new(req.prompt.as_str());
                if let Some(w) = req.width {
                    image.width = w;
                }
                if let Some(h) = req.height {
                    image.height = h;
                }
                self.grok.generate_image(image).await
            }
            ProviderKind::Gemini if !req.input_images.is_empty() => {
                let mut images = Vec::with_capacity(req.input_images.len());
                for path in &req.input_images {
                    images.push(ImageData::read(path).await?);
                }
                self.gemini.edit_images(&images, &req.prompt).await
            }
            ProviderKind::Gemini => self.gemini.generate_image(&req.prompt).await,
            ProviderKind::Openai => self.openai.generate_image(&req.prompt).await,
            ProviderKind::Comfyui => {
                let progress: ProgressFn = Arc::new(|p: Progress| {
                    tracing::debug!(provider = "comfyui", fraction = p.fraction, "{}", p.message);
                });
                self.comfyui
                    .generate_image(&req.to_comfyui(), Some(progress))
                    .await
            }
            ProviderKind::Fal => {
                let endpoint = req
                    .endpoint
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or(&self.fal.settings().image_endpoint);
                Ok(self.fal.text_to_image(endpoint, &req.to_fal()).await?.image)
            }
            ProviderKind::Groq | ProviderKind::Ollama | ProviderKind::Elevenlabs => {
                Err(unsupported(kind, Capability::Image))
            }
        }
    }

    /// Synthesize speech and persist it to the cache directory.
    pub async fn speak(
        &self,
        text: &str,
        voice_id: Option<&str>,
        deadline: Instant,
    ) -> Result<PathBuf, BridgeError> {
        let kind = ProviderKind::Elevenlabs;
        let _permit = Self::acquire_with_deadline(&self.speech_semaphore, deadline, kind).await?;
        let budget = deadline.saturating_duration_since(Instant::now());
        let clip = tokio::time::timeout(budget, self.elevenlabs.text_to_speech(text, voice_id))
            .await
            .map_err(|_| BridgeError::Timeout {
                provider: kind.as_str().to_string(),
                waited_ms: budget.as_millis() as u64,
            })??;
        let path = clip.persist(&self.config.cache_dir).await?;
        tracing::info!(provider = kind.as_str(), path = %path.display(), "speech saved");
        Ok(path)
    }
}

fn unsupported(kind: ProviderKind, capability: Capability) -> BridgeError {
    BridgeError::InvalidRequest(format!("{kind} does not support {}", capability.as_str()))
}

fn key_env(kind: ProviderKind, config: &Config) -> Option<&'static str> {
    use crate::providers::{elevenlabs, fal, gemini, grok, groq, ollama, openai};
    match kind {
        ProviderKind::Xai => Some(grok::API_KEY_ENV),
        ProviderKind::Groq => Some(groq::API_KEY_ENV),
        ProviderKind::Gemini => Some(gemini::API_KEY_ENV),
        ProviderKind::Ollama if config.ollama.mode == OllamaMode::Turbo => Some(ollama::API_KEY_ENV),
        ProviderKind::Ollama | ProviderKind::Comfyui => None,
        ProviderKind::Openai => Some(openai::API_KEY_ENV),
        ProviderKind::Elevenlabs => Some(elevenlabs::API_KEY_ENV),
        ProviderKind::Fal => Some(fal::API_KEY_ENV),
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKey;
    use std::time::Duration;

    #[test]
    fn keyless_backends_are_always_configured() {
        let registry = Registry::from_config(Config::default());
        assert!(registry.is_configured(ProviderKind::Comfyui));
        assert!(registry.is_configured(ProviderKind::Ollama));
        assert!(!registry.is_configured(ProviderKind::Xai));
        assert!(!registry.is_configured(ProviderKind::Fal));
    }

    #[test]
    fn list_includes_every_provider() {
        let mut config = Config::default();
        config.groq.api_key = ApiKey::new("gsk");
        let registry = Registry::from_config(config);
        let rows = registry.list_providers();
        assert_eq!(rows.len(), ProviderKind::ALL.len());
        let groq = rows.iter().find(|r| r.kind == ProviderKind::Groq).unwrap();
        assert!(groq.configured);
        assert_eq!(groq.key_env, Some("GROQ_API_KEY"));
        let comfy = rows.iter().find(|r| r.kind == ProviderKind::Comfyui).unwrap();
        assert_eq!(comfy.key_env, None);
    }

    #[test]
    fn comfyui_request_maps_loras_at_full_strength() {
        let mut req = ImageRequest::new("a fox", Instant::now());
        req.width = Some(768);
        req.loras = vec!["pixel.safetensors".into()];
        let c = req.to_comfyui();
        assert_eq!(c.width, 768);
        assert_eq!(c.height, 512);
        assert_eq!(c.seed, -1);
        assert_eq!(c.loras[0].model_strength, 1.0);
        assert_eq!(c.effective_loras().len(), 1);
    }

    #[test]
    fn fal_request_fills_missing_side_and_drops_random_seed() {
        let mut req = ImageRequest::new("a fox", Instant::now());
        req.height = Some(640);
        req.seed = Some(-1);
        let f = req.to_fal();
        assert_eq!(f.image_size, Some(FalImageSize { width: 640, height: 640 }));
        assert_eq!(f.seed, None);
        assert_eq!(f.num_images, 1);

        let f = ImageRequest::new("a fox", Instant::now()).to_fal();
        assert_eq!(f.image_size, None);
    }

    #[tokio::test]
    async fn chat_rejects_image_only_provider() {
        let registry = Registry::from_config(Config::default());
        let req = TextRequest {
            prompt: "hi".into(),
            model: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            deadline: Instant::now() + Duration::from_secs(5),
            cancellation_token: None,
        };
        let err = registry.chat(ProviderKind::Comfyui, &req).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
        assert_eq!(registry.text_semaphore_permits(), TEXT_MAX_CONCURRENT);
    }

    #[tokio::test]
    async fn expired_deadline_times_out_before_dispatch() {
        let registry = Registry::from_config(Config::default());
        let req = ImageRequest::new("a fox", Instant::now() - Duration::from_millis(1));
        let err = registry
            .generate_image(ProviderKind::Comfyui, &req)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert_eq!(registry.image_semaphore_permits(), IMAGE_MAX_CONCURRENT);
    }
}
