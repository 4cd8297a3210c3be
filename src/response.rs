use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

/// JSON envelope every tool returns as a single text content block.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub status: &'static str,
    pub content: String,
    /// "text", "markdown", or "file" when `content` is a path on disk.
    pub content_type: &'static str,
    pub metadata: ToolMetadata,
}

#[derive(Debug, Serialize)]
pub struct ToolMetadata {
    pub tool_name: String,
    pub model_used: String,
    pub provider_used: String,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub duration_seconds: f64,
    /// Set when a streaming reply was cut short.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl ToolMetadata {
    pub fn new(tool_name: &str, provider: &str, model: &str, duration_seconds: f64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            model_used: model.to_string(),
            provider_used: provider.to_string(),
            duration_seconds,
            partial: false,
        }
    }
}

/// Serialize f64, clamping non-finite values (NaN, Inf) to 0.0.
fn serialize_finite_f64<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(if v.is_finite() { *v } else { 0.0 })
}

impl ToolResponse {
    pub fn success(content: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "success",
            content,
            content_type: "text",
            metadata,
        }
    }

    pub fn markdown(content: String, metadata: ToolMetadata) -> Self {
        Self {
            content_type: "markdown",
            ..Self::success(content, metadata)
        }
    }

    pub fn file(path: &std::path::Path, metadata: ToolMetadata) -> Self {
        Self {
            content_type: "file",
            ..Self::success(path.display().to_string(), metadata)
        }
    }

    pub fn error(message: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "error",
            content: message,
            content_type: "text",
            metadata,
        }
    }

    /// Convert to an MCP result. Provider failures still succeed at the
    /// transport level; the caller reads `"status": "error"` from the payload.
    pub fn into_call_tool_result(self) -> CallToolResult {
        match serde_json::to_string(&self) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => {
                let escaped = e.to_string().replace('\\', "\\\\").replace('"', "\\\"");
                CallToolResult::success(vec![Content::text(format!(
                    r#"{{"status":"error","content":"serialization failed: {escaped}","content_type":"text","metadata":{{}}}}"#
                ))])
            }
        }
    }
}
