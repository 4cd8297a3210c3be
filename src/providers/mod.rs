//! Clients for each generative-AI backend. All of them share one
//! [`HttpDispatch`](crate::dispatch::http::HttpDispatch) and read their settings
//! from [`Config`](crate::config::Config).

pub mod comfyui;
pub mod elevenlabs;
pub mod fal;
pub mod gemini;
pub mod grok;
pub mod groq;
pub mod ollama;
pub mod openai;

use std::time::Duration;

/// Convert a seconds value from config into a `Duration`, treating negative or
/// non-finite input as zero.
pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(join_url("https://fal.run/", "fal-ai/flux/dev"), "https://fal.run/fal-ai/flux/dev");
        assert_eq!(join_url("http://h:1", "/prompt"), "http://h:1/prompt");
    }

    #[test]
    fn secs_clamps_bad_input() {
        assert_eq!(secs(0.25), Duration::from_millis(250));
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
    }
}
