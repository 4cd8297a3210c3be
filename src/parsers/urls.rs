use serde_json::Value;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".webp", ".gif", ".bmp"];

const MEDIA_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".webp", ".gif", ".bmp", // image
    ".mp4", ".mov", ".webm", // video
    ".mp3", ".wav", ".flac", ".m4a", // audio
    ".obj", ".glb", ".gltf", ".fbx", // mesh
];

fn is_file_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http") && MEDIA_EXTENSIONS.iter().any(|e| lower.contains(e))
}

pub fn is_image_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|e| lower.contains(e))
}

/// Every http(s) string in `value` that looks like a generated media file, in
/// document order, without duplicates.
pub fn file_urls(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect(value, &mut out);
    out
}

fn collect(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if is_file_url(s) && !out.iter().any(|u| u == s) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect(v, out)),
        _ => {}
    }
}
