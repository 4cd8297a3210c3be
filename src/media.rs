use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::BridgeError;

/// A decoded image returned by a provider. Bytes are kept encoded (PNG, JPEG, ...);
/// the MIME type is sniffed from the magic bytes, not trusted from the server.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageData {
    /// Accept raw bytes only if they look like an image we know how to name.
    pub fn from_bytes(provider: &str, bytes: Vec<u8>) -> Result<Self, BridgeError> {
        let mime_type = sniff_image_mime(&bytes)
            .ok_or_else(|| BridgeError::decode(provider, "failed to load image from bytes"))?;
        Ok(Self { bytes, mime_type })
    }

    pub fn from_base64(provider: &str, data: &str) -> Result<Self, BridgeError> {
        let bytes = BASE64
            .decode(data.trim())
            .map_err(|e| BridgeError::decode(provider, format!("invalid base64 image: {e}")))?;
        Self::from_bytes(provider, bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn extension(&self) -> &'static str {
        match self.mime_type {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/bmp" => "bmp",
            _ => "bin",
        }
    }

    /// Read an image file from disk (for inline uploads).
    pub async fn read(path: &Path) -> Result<Self, BridgeError> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes("local", bytes)
    }

    /// Write the image as `{stem}.{ext}` inside `dir`, creating it if needed.
    pub async fn persist(&self, dir: &Path, stem: &str) -> Result<PathBuf, BridgeError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{stem}.{}", self.extension()));
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'B', b'M', ..] => Some("image/bmp"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Wav,
    Pcm,
}

impl AudioFormat {
    /// Derive the container from an ElevenLabs-style `output_format` string
    /// such as `mp3_44100_128` or `pcm_16000`.
    pub fn from_output_format(output_format: &str) -> Self {
        if output_format.starts_with("mp3") {
            Self::Mp3
        } else if output_format.starts_with("pcm") {
            Self::Pcm
        } else {
            Self::Wav
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Pcm => "pcm",
        }
    }
}

#[derive(Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
}

impl std::fmt::Debug for AudioClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioClip")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl AudioClip {
    /// Write the clip as `tts.{ext}` in `dir`, replacing the previous clip.
    /// Temp file + rename so a reader never sees a half-written clip.
    pub async fn persist(&self, dir: &Path) -> Result<PathBuf, BridgeError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("tts.{}", self.format.extension()));
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &self.bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(path)
    }
}

/// Typed result of one remote operation.
#[derive(Debug, Clone)]
pub enum Decoded {
    Text(String),
    Image(ImageData),
    Audio(AudioClip),
    Json(serde_json::Value),
}

impl Decoded {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Audio(_) => "audio",
            Self::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(sniff_image_mime(PNG_HEADER), Some("image/png"));
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_image_mime(b"GIF89a"), Some("image/gif"));
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_image_mime(b"{\"error\":1}"), None);
        assert_eq!(sniff_image_mime(&[]), None);
    }

    #[test]
    fn rejects_non_image_bytes() {
        let err = ImageData::from_bytes("xai", b"not an image".to_vec()).unwrap_err();
        assert!(err.to_string().contains("failed to load image"));
    }

    #[test]
    fn base64_roundtrip_keeps_mime() {
        let img = ImageData::from_bytes("test", PNG_HEADER.to_vec()).unwrap();
        let back = ImageData::from_base64("test", &img.to_base64()).unwrap();
        assert_eq!(back, img);
        assert_eq!(back.extension(), "png");
    }

    #[test]
    fn invalid_base64_is_decode_error() {
        let err = ImageData::from_base64("gemini", "!!!").unwrap_err();
        assert!(matches!(err, BridgeError::Decode { .. }));
    }

    #[test]
    fn audio_format_from_output_format() {
        assert_eq!(AudioFormat::from_output_format("mp3_44100_128"), AudioFormat::Mp3);
        assert_eq!(AudioFormat::from_output_format("pcm_16000"), AudioFormat::Pcm);
        assert_eq!(AudioFormat::from_output_format("wav"), AudioFormat::Wav);
    }

    #[tokio::test]
    async fn audio_persist_writes_tts_file() {
        let dir = std::env::temp_dir().join(format!("polarai-tts-{}", std::process::id()));
        let clip = AudioClip {
            bytes: b"ID3fake".to_vec(),
            format: AudioFormat::Mp3,
        };
        let path = clip.persist(&dir).await.unwrap();
        assert!(path.ends_with("tts.mp3"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"ID3fake");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn decoded_reports_its_kind() {
        assert_eq!(Decoded::Text("hi".into()).kind(), "text");
        assert_eq!(Decoded::Json(serde_json::json!({"ok": true})).kind(), "json");
    }
}
