use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ApiKey;
use crate::dispatch::http::{HttpDispatch, RequestSpec};
use crate::error::BridgeError;
use crate::media::{AudioClip, AudioFormat};
use crate::providers::join_url;

pub const PROVIDER: &str = "elevenlabs";
pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElevenLabsSettings {
    pub api_key: ApiKey,
    pub base_url: String,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
}

impl Default for ElevenLabsSettings {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            base_url: "https://api.elevenlabs.io".to_string(),
            voice_id: String::new(),
            model_id: "eleven_multilingual_v2".to_string(),
            output_format: "mp3_44100_128".to_string(),
        }
    }
}

#[derive(Serialize)]
struct TtsBody<'a> {
    text: &'a str,
    model_id: &'a str,
}

pub struct ElevenLabsClient {
    settings: ElevenLabsSettings,
    http: Arc<HttpDispatch>,
}

impl ElevenLabsClient {
    pub fn new(settings: ElevenLabsSettings, http: Arc<HttpDispatch>) -> Self {
        Self { settings, http }
    }

    /// Synthesize `text`. `voice_id` overrides the configured default voice.
    pub async fn text_to_speech(
        &self,
        text: &str,
        voice_id: Option<&str>,
    ) -> Result<AudioClip, BridgeError> {
        if text.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("TTS text is empty".to_string()));
        }
        let api_key = self.settings.api_key.require(PROVIDER, API_KEY_ENV)?;
        let voice = voice_id
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(&self.settings.voice_id);
        if voice.trim().is_empty() {
            return Err(BridgeError::InvalidRequest(
                "no voice id given and no default voice configured".to_string(),
            ));
        }

        let url = format!(
            "{}?output_format={}",
            join_url(&self.settings.base_url, &format!("/v1/text-to-speech/{voice}")),
            self.settings.output_format
        );
        let body = serde_json::to_value(TtsBody {
            text,
            model_id: &self.settings.model_id,
        })
        .map_err(|e| BridgeError::InvalidRequest(format!("unserializable TTS request: {e}")))?;

        tracing::info!(provider = PROVIDER, voice = voice, chars = text.len(), "requesting TTS");

        let spec = RequestSpec::post_json(url, body).header("xi-api-key", api_key);
        let reply = self.http.send_ok(PROVIDER, &spec).await?;
        if reply.body.is_empty() {
            return Err(BridgeError::decode(PROVIDER, "empty audio body"));
        }

        Ok(AudioClip {
            bytes: reply.body,
            format: AudioFormat::from_output_format(&self.settings.output_format),
        })
    }
}
