use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("API key is empty for {provider}. Set it in config or env {env_var}.")]
    MissingApiKey {
        provider: String,
        env_var: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP {status} from {provider}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("decode error from {provider}: {message}")]
    Decode { provider: String, message: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("{provider} timed out after {waited_ms}ms")]
    Timeout { provider: String, waited_ms: u64 },

    #[error("{provider} operation cancelled")]
    Cancelled { provider: String },

    #[error("{provider} job ended with status: {status}")]
    JobFailed { provider: String, status: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn decode(provider: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::MissingApiKey { provider, .. }
            | Self::Http { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::Decode { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Cancelled { provider }
            | Self::JobFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    /// Only 429/503/504 count among HTTP statuses; everything else non-2xx is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Http { status, .. } => matches!(status, 429 | 503 | 504),
            Self::Request(e) => e.is_connect() || e.is_timeout(),
            Self::Timeout { .. } | Self::WebSocket(_) => true,
            _ => false,
        }
    }

    /// Sanitized message safe for returning to tool callers.
    /// Keeps the status code but trims upstream bodies and never echoes secrets.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingApiKey { provider, env_var } => {
                format!("{provider} API key is not configured (set {env_var})")
            }
            Self::InvalidRequest(msg) => msg.clone(),
            Self::Http {
                provider,
                status,
                body,
            } => {
                let preview: String = body.chars().take(300).collect();
                let suffix = if preview.len() < body.len() { "..." } else { "" };
                format!("HTTP {status} from {provider}: {preview}{suffix}")
            }
            Self::RateLimited { provider, .. } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Decode { provider, .. } => format!("failed to parse {provider} response"),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::WebSocket(_) => "websocket connection failed".to_string(),
            Self::Timeout {
                provider,
                waited_ms,
            } => format!("{provider} timed out after {waited_ms}ms"),
            Self::Cancelled { provider } => format!("{provider} operation cancelled"),
            Self::JobFailed { provider, status } => format!("{provider} job {status}"),
            Self::Io(e) => format!("io error: {e}"),
            Self::Config(msg) => format!("config error: {msg}"),
        }
    }
}
