use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::ApiKey;
use crate::dispatch::http::{HttpDispatch, RequestSpec};
use crate::dispatch::{TextReply, TextRequest};
use crate::error::BridgeError;
use crate::media::ImageData;

pub const PROVIDER: &str = "gemini";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const FALLBACK_API_KEY_ENV: &str = "GOOGLE_API_KEY";

pub const DEFAULT_EDIT_INSTRUCTION: &str = "Blend these images harmoniously.";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub api_key: ApiKey,
    pub base_url: String,
    pub chat_model: String,
    pub image_model: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            chat_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image-preview".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InlineData {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    Inline { inline_data: InlineData },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image: &ImageData) -> Self {
        Self::Inline {
            inline_data: InlineData {
                mime_type: image.mime_type.to_string(),
                data: image.to_base64(),
            },
        }
    }
}

/// One conversation turn. Earlier turns can be passed back as history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Deserialize)]
struct InlineDataResp {
    #[serde(default, rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartResp {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<InlineDataResp>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentResp {
    #[serde(default)]
    parts: Vec<PartResp>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<ContentResp>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateContentResponse {
    fn parts(&self) -> impl Iterator<Item = &PartResp> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
    }

    /// First non-empty text part across all candidates.
    pub fn first_text(&self) -> Option<&str> {
        self.parts()
            .filter_map(|p| p.text.as_deref())
            .find(|t| !t.is_empty())
    }

    /// First inline payload as `(mime_type, base64)`.
    pub fn first_inline_image(&self) -> Option<(&str, &str)> {
        self.parts().find_map(|p| {
            let inline = p.inline_data.as_ref()?;
            let data = inline.data.as_deref().filter(|d| !d.is_empty())?;
            Some((inline.mime_type.as_deref().unwrap_or("image/png"), data))
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GeminiClient {
    settings: GeminiSettings,
    http: Arc<HttpDispatch>,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings, http: Arc<HttpDispatch>) -> Self {
        Self { settings, http }
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        deadline: Option<Instant>,
    ) -> Result<GenerateContentResponse, BridgeError> {
        let api_key = self.settings.api_key.require(PROVIDER, API_KEY_ENV)?;
        let url = format!(
            "{}/{model}:generateContent",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = serde_json::to_value(request)
            .map_err(|e| BridgeError::InvalidRequest(format!("unserializable Gemini request: {e}")))?;

        tracing::debug!(provider = PROVIDER, model = model, body = %body, "generateContent request");

        let mut spec = RequestSpec::post_json(url, body).header("x-goog-api-key", api_key);
        if let Some(deadline) = deadline {
            spec = spec.within(deadline);
        }
        let reply = self.http.send_ok(PROVIDER, &spec).await?;

        tracing::debug!(provider = PROVIDER, model = model, body = %reply.text(), "generateContent response");
        reply.json(PROVIDER)
    }

    /// Text chat, optionally with images. Attached images switch to the image model.
    pub async fn chat(
        &self,
        prompt: &str,
        images: &[ImageData],
        history: &[Content],
    ) -> Result<String, BridgeError> {
        self.chat_with(prompt, images, history, None, None, None).await
    }

    async fn chat_with(
        &self,
        prompt: &str,
        images: &[ImageData],
        history: &[Content],
        model: Option<&str>,
        generation_config: Option<GenerationConfig>,
        deadline: Option<Instant>,
    ) -> Result<String, BridgeError> {
        if prompt.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("prompt must not be empty".to_string()));
        }
        let model = match model {
            Some(m) => m,
            None if images.is_empty() => &self.settings.chat_model,
            None => &self.settings.image_model,
        };

        let mut parts = vec![Part::text(prompt)];
        parts.extend(images.iter().map(Part::image));

        let mut contents = history.to_vec();
        contents.push(Content::user(parts));

        let response = self
            .generate(
                model,
                &GenerateContentRequest {
                    contents,
                    generation_config,
                },
                deadline,
            )
            .await?;

        response
            .first_text()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BridgeError::decode(PROVIDER, "empty reply"))
    }

    /// Text-to-image. A text-only reply becomes the error message.
    pub async fn generate_image(&self, prompt: &str) -> Result<ImageData, BridgeError> {
        if prompt.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("prompt must not be empty".to_string()));
        }
        let request = GenerateContentRequest {
            contents: vec![Content::user(vec![Part::text(prompt)])],
            generation_config: None,
        };
        let response = self
            .generate(&self.settings.image_model, &request, None)
            .await?;
        Self::image_from(&response)
    }

    /// Combine or edit the given images following `instruction`.
    pub async fn edit_images(
        &self,
        images: &[ImageData],
        instruction: &str,
    ) -> Result<ImageData, BridgeError> {
        if images.is_empty() {
            return Err(BridgeError::InvalidRequest("no input images".to_string()));
        }
        let instruction = if instruction.trim().is_empty() {
            DEFAULT_EDIT_INSTRUCTION
        } else {
            instruction
        };

        let mut parts: Vec<Part> = images.iter().map(Part::image).collect();
        parts.push(Part::text(instruction));

        let request = GenerateContentRequest {
            contents: vec![Content::user(parts)],
            generation_config: None,
        };
        let response = self
            .generate(&self.settings.image_model, &request, None)
            .await?;
        Self::image_from(&response)
    }

    fn image_from(response: &GenerateContentResponse) -> Result<ImageData, BridgeError> {
        match response.first_inline_image() {
            Some((mime, data)) => {
                tracing::debug!(provider = PROVIDER, mime = %mime, "inline image returned");
                ImageData::from_base64(PROVIDER, data)
            }
            None => {
                let message = match response.first_text() {
                    Some(text) => format!("no image returned; text-only reply: {text}"),
                    None => "no image returned".to_string(),
                };
                Err(BridgeError::decode(PROVIDER, message))
            }
        }
    }

    pub async fn complete(&self, req: &TextRequest) -> Result<TextReply, BridgeError> {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.settings.chat_model.clone());
        let history: Vec<Content> = req
            .system_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| vec![Content::user(vec![Part::text(s)]), Content::model("Understood.")])
            .unwrap_or_default();
        let generation_config = (req.temperature.is_some() || req.max_tokens.is_some()).then(|| {
            GenerationConfig {
                temperature: req.temperature,
                top_p: None,
                max_output_tokens: req.max_tokens,
            }
        });

        let text = self
            .chat_with(
                &req.prompt,
                &[],
                &history,
                Some(&model),
                generation_config,
                Some(req.deadline),
            )
            .await?;
        Ok(TextReply {
            text,
            model,
            provider: PROVIDER.to_string(),
            partial: false,
        })
    }
}
