use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ApiKey;
use crate::dispatch::http::{HttpDispatch, RequestSpec};
use crate::error::BridgeError;
use crate::media::ImageData;
use crate::parsers::{file_urls, is_image_url};
use crate::providers::join_url;

pub const PROVIDER: &str = "fal";
pub const API_KEY_ENV: &str = "FAL_KEY";

/// Endpoint ids for the models this bridge has been exercised against.
pub mod endpoints {
    pub const FAST_LIGHTNING_SDXL: &str = "fal-ai/fast-lightning-sdxl";
    pub const TRIPO_3D: &str = "tripo3d/tripo/v2.5/image-to-3d";
    pub const FLUX_DEV: &str = "fal-ai/flux/dev";
    pub const GEMINI_EDIT: &str = "fal-ai/gemini-25-flash-image/edit";
    pub const AURA_SR: &str = "fal-ai/aura-sr";
    pub const KLING_I2V: &str = "fal-ai/kling-video/v2.1/master/image-to-video";
    pub const WAN_EFFECTS: &str = "fal-ai/wan-effects";
    pub const ANY_LLM: &str = "fal-ai/any-llm";
    pub const ELEVENLABS_SFX: &str = "fal-ai/elevenlabs/sound-effects/v2";
    pub const CASSETTE_MUSIC: &str = "cassetteai/music-generator";
    pub const SONAUTO_MUSIC: &str = "sonauto/v2/text-to-music";
    pub const IMAGEN4_FAST: &str = "fal-ai/imagen4/preview/fast";
    pub const GEMINI_GENERATE: &str = "fal-ai/gemini-25-flash-image";
    pub const ANY_LLM_VISION: &str = "fal-ai/any-llm/vision";
}

/// Max URLs listed by [`summarize`].
const SUMMARY_URL_LIMIT: usize = 6;
const SUMMARY_TEXT_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FalSettings {
    pub api_key: ApiKey,
    pub base_url: String,
    /// Endpoint used by the `generate_image` tool.
    pub image_endpoint: String,
    pub timeout_secs: u64,
}

impl Default for FalSettings {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            base_url: "https://fal.run/".to_string(),
            image_endpoint: endpoints::FLUX_DEV.to_string(),
            timeout_secs: 300,
        }
    }
}

/// Body for fal's text-to-image endpoints. Unset options are left to the
/// endpoint's own defaults.
#[derive(Debug, Clone, Serialize)]
pub struct FalImageRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<FalImageSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    pub num_images: u32,
}

impl FalImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            image_size: None,
            num_inference_steps: None,
            seed: None,
            image_urls: Vec::new(),
            num_images: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FalImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FalImage {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// The `images` list most image endpoints return.
#[derive(Debug, Clone, Deserialize)]
pub struct FalImagesResponse {
    #[serde(default)]
    pub images: Vec<FalImage>,
}

/// An image endpoint's result: the first image plus everything else it returned.
#[derive(Debug, Clone)]
pub struct FalImageResult {
    pub image: ImageData,
    pub image_url: String,
    pub urls: Vec<String>,
    pub summary: String,
}

/// Short human-readable digest of an endpoint's JSON output.
pub fn summarize(value: &Value, urls: &[String]) -> String {
    let mut out = String::new();

    if let Some(images) = value.get("images").and_then(Value::as_array) {
        let _ = writeln!(out, "images: {}", images.len());
    }
    if value.get("video").is_some() {
        out.push_str("video: yes\n");
    }
    if value.get("audio").is_some() {
        out.push_str("audio: yes\n");
    }
    if value.get("mesh").or_else(|| value.get("model")).is_some() {
        out.push_str("3d: yes\n");
    }

    if let Some(output) = value.get("output").map(text_of).filter(|t| !t.is_empty()) {
        let _ = writeln!(out, "--- output ---\n{}", truncate(&output, SUMMARY_TEXT_LIMIT));
    }

    if !urls.is_empty() {
        out.push_str("--- urls ---\n");
        for url in urls.iter().take(SUMMARY_URL_LIMIT) {
            let _ = writeln!(out, "{url}");
        }
        if urls.len() > SUMMARY_URL_LIMIT {
            let _ = writeln!(out, "({} more omitted)", urls.len() - SUMMARY_URL_LIMIT);
        }
    }

    if let Some(desc) = value
        .get("description")
        .map(text_of)
        .filter(|t| !t.is_empty())
    {
        let _ = writeln!(out, "--- description ---\n{}", truncate(&desc, SUMMARY_TEXT_LIMIT));
    }

    out.trim_end().to_string()
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

pub struct FalClient {
    settings: FalSettings,
    http: Arc<HttpDispatch>,
}

impl FalClient {
    pub fn new(settings: FalSettings, http: Arc<HttpDispatch>) -> Self {
        Self { settings, http }
    }

    pub fn settings(&self) -> &FalSettings {
        &self.settings
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    /// POST `body` to a synchronous fal endpoint and return its JSON output.
    pub async fn run(&self, endpoint: &str, body: &Value) -> Result<Value, BridgeError> {
        let api_key = self.settings.api_key.require(PROVIDER, API_KEY_ENV)?;
        if endpoint.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("endpoint must not be empty".to_string()));
        }

        tracing::info!(provider = PROVIDER, endpoint = endpoint, "calling fal endpoint");

        let spec = RequestSpec::post_json(join_url(&self.settings.base_url, endpoint), body.clone())
            .header("Accept", "application/json")
            .header("Authorization", format!("Key {api_key}"))
            .timeout(self.timeout());
        self.http.send_ok(PROVIDER, &spec).await?.json(PROVIDER)
    }

    pub async fn text_to_image(
        &self,
        endpoint: &str,
        request: &FalImageRequest,
    ) -> Result<FalImageResult, BridgeError> {
        if request.prompt.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("prompt must not be empty".to_string()));
        }
        let body = serde_json::to_value(request)
            .map_err(|e| BridgeError::InvalidRequest(format!("unserializable request: {e}")))?;
        self.generate_image(endpoint, &body).await
    }

    /// Run an image endpoint and download its first image. The typed `images`
    /// list wins; otherwise the first image URL anywhere in the output is used.
    pub async fn generate_image(&self, endpoint: &str, body: &Value) -> Result<FalImageResult, BridgeError> {
        let output = self.run(endpoint, body).await?;
        let urls = file_urls(&output);
        let summary = summarize(&output, &urls);

        let listed = serde_json::from_value::<FalImagesResponse>(output.clone())
            .ok()
            .and_then(|r| r.images.into_iter().map(|i| i.url).find(|u| !u.is_empty()));
        let image_url = listed
            .or_else(|| urls.iter().find(|u| is_image_url(u)).cloned())
            .ok_or_else(|| {
                BridgeError::decode(PROVIDER, format!("no image in response; {summary}"))
            })?;

        let bytes = self.http.get_bytes(PROVIDER, &image_url, self.timeout()).await?;
        let image = ImageData::from_bytes(PROVIDER, bytes)?;

        Ok(FalImageResult {
            image,
            image_url,
            urls,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn image_request_skips_unset_options() {
        let v = serde_json::to_value(FalImageRequest::new("a fox")).unwrap();
        assert_eq!(v, json!({"prompt": "a fox", "num_images": 1}));

        let req = FalImageRequest {
            image_size: Some(FalImageSize { width: 768, height: 512 }),
            seed: Some(9),
            ..FalImageRequest::new("a fox")
        };
        let v = serde_json::to_value(req).unwrap();
        assert_eq!(v["image_size"], json!({"width": 768, "height": 512}));
        assert_eq!(v["seed"], 9);
        assert!(v.get("negative_prompt").is_none());
    }

    #[test]
    fn summary_lists_counts_and_caps_urls() {
        let urls: Vec<String> = (0..8).map(|i| format!("https://f/{i}.png")).collect();
        let v = json!({"images": [{}, {}], "description": "two foxes"});
        let s = summarize(&v, &urls);
        assert!(s.starts_with("images: 2"));
        assert!(s.contains("https://f/5.png"));
        assert!(!s.contains("https://f/6.png"));
        assert!(s.contains("(2 more omitted)"));
        assert!(s.ends_with("two foxes"));
    }

    #[test]
    fn summary_truncates_long_output() {
        let v = json!({"output": "x".repeat(600)});
        let s = summarize(&v, &[]);
        assert!(s.ends_with("..."));
        assert!(s.len() < 600);
    }

    #[test]
    fn images_response_parses() {
        let r: FalImagesResponse = serde_json::from_value(json!({
            "images": [{"url": "https://v3.fal.media/a.png", "content_type": "image/png", "width": 1024}]
        }))
        .unwrap();
        assert_eq!(r.images[0].width, Some(1024));
        assert_eq!(r.images[0].height, None);
    }
}
