use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SpeakRequest {
    /// Text to synthesize.
    pub text: String,
    /// ElevenLabs voice id. Omit to use the configured voice.
    pub voice_id: Option<String>,
}
