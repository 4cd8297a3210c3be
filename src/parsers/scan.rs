use std::sync::LazyLock;

use regex::Regex;

static IMAGES_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""images"\s*:\s*\[\s*\{([\s\S]*?)\}\s*\]"#).expect("valid images regex")
});
static FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""filename"\s*:\s*"([^"]+)""#).expect("valid filename regex"));
static SUBFOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""subfolder"\s*:\s*"([^"]*)""#).expect("valid subfolder regex"));
static TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""type"\s*:\s*"([^"]*)""#).expect("valid type regex"));

/// Location of a generated image on a ComfyUI server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
}

/// Find the first `"key": "<string>"` pair anywhere in `json` and return its
/// unescaped value. Matches nested keys too; only string values are returned.
pub fn string_value(json: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let mut from = 0;

    while let Some(rel) = json[from..].find(&needle) {
        let after_key = from + rel + needle.len();
        from = after_key;

        let rest = json[after_key..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(body) = rest.strip_prefix('"') else {
            continue;
        };

        let mut escaped = false;
        for (i, c) in body.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                return Some(unescape(&body[..i]));
            }
        }
        // Unterminated string
        return None;
    }
    None
}

/// Reverse JSON string escapes. Unknown or truncated escapes are kept verbatim.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) if hex.len() == 4 => out.push(ch),
                    _ => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// First image entry of a ComfyUI `/history/{id}` body. `subfolder` defaults to
/// empty and `type` to `output`.
pub fn first_image_info(json: &str) -> Option<ImageInfo> {
    let block = IMAGES_BLOCK.captures(json)?.get(1)?.as_str();
    let filename = FILENAME.captures(block)?.get(1)?.as_str().to_string();
    let subfolder = SUBFOLDER
        .captures(block)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    let kind = TYPE
        .captures(block)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "output".to_string());

    Some(ImageInfo {
        filename,
        subfolder,
        kind,
    })
}

/// Read a top-level string field, parsing `body` as JSON when possible and
/// falling back to [`string_value`] otherwise.
pub fn response_field(body: &str, key: &str) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(v) => v.get(key).and_then(|f| f.as_str()).map(str::to_string),
        Err(_) => string_value(body, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_value_reads_first_match() {
        let json = r#"{"id": "vs_123", "status":"in_progress", "nested": {"id": "x"}}"#;
        assert_eq!(string_value(json, "id").as_deref(), Some("vs_123"));
        assert_eq!(string_value(json, "status").as_deref(), Some("in_progress"));
    }

    #[test]
    fn string_value_honours_escapes() {
        let json = r#"{"value": "line1\nsaid \"hi\" \\ done"}"#;
        assert_eq!(
            string_value(json, "value").as_deref(),
            Some("line1\nsaid \"hi\" \\ done")
        );
    }

    #[test]
    fn string_value_skips_non_string_values() {
        let json = r#"{"id": 42, "other": {"id": "real"}}"#;
        assert_eq!(string_value(json, "id").as_deref(), Some("real"));
    }

    #[test]
    fn string_value_missing_or_malformed_is_none() {
        assert_eq!(string_value(r#"{"a":"b"}"#, "id"), None);
        assert_eq!(string_value(r#"{"id": "unterminated"#, "id"), None);
        assert_eq!(string_value("", "id"), None);
        assert_eq!(string_value(r#""id""#, "id"), None);
    }

    #[test]
    fn unescape_handles_unicode_and_bad_sequences() {
        assert_eq!(unescape(r"café"), "café");
        assert_eq!(unescape(r"a\/b"), "a/b");
        assert_eq!(unescape(r"bad\uZZ"), r"bad\uZZ");
        assert_eq!(unescape("trailing\\"), "trailing\\");
        assert_eq!(unescape(r"\q"), r"\q");
    }

    #[test]
    fn first_image_info_with_defaults() {
        let json = r#"{"abc": {"outputs": {"8": {"images": [ {"filename": "PolarAI_00001_.png"} ]}}}}"#;
        let info = first_image_info(json).unwrap();
        assert_eq!(info.filename, "PolarAI_00001_.png");
        assert_eq!(info.subfolder, "");
        assert_eq!(info.kind, "output");
    }

    #[test]
    fn first_image_info_reads_all_fields() {
        let json = r#"{"images":[{"filename":"a.png","subfolder":"sub","type":"temp"},{"filename":"b.png"}]}"#;
        let info = first_image_info(json).unwrap();
        assert_eq!(
            info,
            ImageInfo {
                filename: "a.png".into(),
                subfolder: "sub".into(),
                kind: "temp".into(),
            }
        );
    }

    #[test]
    fn first_image_info_absent() {
        assert_eq!(first_image_info("{}"), None);
        assert_eq!(first_image_info(r#"{"images": []}"#), None);
        assert_eq!(first_image_info(r#"{"images": [{"subfolder": ""}]}"#), None);
        assert_eq!(first_image_info("not json at all"), None);
    }

    #[test]
    fn response_field_prefers_typed_parse() {
        assert_eq!(
            response_field(r#"{"output_text":"hello\nworld"}"#, "output_text").as_deref(),
            Some("hello\nworld")
        );
        assert_eq!(response_field(r#"{"output_text": 3}"#, "output_text"), None);
        // Truncated body falls back to scanning
        assert_eq!(
            response_field(r#"{"id":"run_1","status":"queued""#, "status").as_deref(),
            Some("queued")
        );
    }
}
