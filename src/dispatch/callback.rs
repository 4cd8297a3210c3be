use std::future::Future;
use std::sync::Arc;

use crate::error::BridgeError;

/// Progress report for long-running jobs. `fraction` is in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub fraction: f32,
    pub message: String,
}

impl Progress {
    pub fn new(fraction: f32, message: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Await `operation` and hand its outcome to exactly one of the two callbacks.
///
/// Both callbacks are `FnOnce` and consumed here, so neither can fire twice and
/// one always fires. Returns true on success.
pub async fn deliver<T, Fut, S, E>(operation: Fut, on_success: S, on_error: E) -> bool
where
    Fut: Future<Output = Result<T, BridgeError>>,
    S: FnOnce(T),
    E: FnOnce(String),
{
    match operation.await {
        Ok(value) => {
            on_success(value);
            true
        }
        Err(e) => {
            tracing::debug!(provider = e.provider().unwrap_or("-"), "delivering error: {e}");
            on_error(e.to_string());
            false
        }
    }
}
