use schemars::JsonSchema;
use serde::Deserialize;

use crate::tools::enums::ProviderKind;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateImageRequest {
    /// Backend: comfyui, xai, gemini, openai or fal (defaults to comfyui).
    pub provider: Option<ProviderKind>,
    /// What to draw. For gemini with `input_images`, the edit instruction.
    pub prompt: String,
    /// Things to avoid (comfyui only).
    pub negative_prompt: Option<String>,
    /// Image width in pixels (comfyui and xai).
    pub width: Option<u32>,
    /// Image height in pixels (comfyui and xai).
    pub height: Option<u32>,
    /// Sampler steps (comfyui only).
    pub steps: Option<u32>,
    /// Seed; negative or omitted picks a random one (comfyui only).
    pub seed: Option<i64>,
    /// Checkpoint file name (comfyui only; defaults to the configured checkpoint).
    pub checkpoint: Option<String>,
    /// LoRA file names chained after the checkpoint at full strength (comfyui only).
    pub loras: Option<Vec<String>>,
    /// Endpoint id such as "fal-ai/flux/dev" (fal only).
    pub endpoint: Option<String>,
    /// Local image files to edit or blend (gemini only).
    pub input_images: Option<Vec<String>>,
}

pub const DEFAULT_PROVIDER: ProviderKind = ProviderKind::Comfyui;

impl GenerateImageRequest {
    pub fn provider_or_default(&self) -> ProviderKind {
        self.provider.unwrap_or(DEFAULT_PROVIDER)
    }
}
