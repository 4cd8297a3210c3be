use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::dispatch::OperationHandle;
use crate::dispatch::http::{HttpDispatch, RequestSpec};
use crate::error::BridgeError;

/// Result of polling a remote job.
#[derive(Debug)]
pub enum PollStatus<T> {
    /// Job is still running.
    InProgress,
    /// Job reached its success state.
    Completed(T),
    /// Job reached a failing terminal state (status text).
    Failed(String),
}

/// Provider-specific request/response handling for status-polled jobs.
pub trait PollApi: Send + Sync {
    type Output: Send;

    fn provider(&self) -> &str;

    /// Build the status request for `handle`. Called once per poll.
    fn build_poll_request(&self, handle: &OperationHandle) -> RequestSpec;

    /// Interpret a 2xx poll body.
    fn parse_poll_response(&self, body: &[u8]) -> Result<PollStatus<Self::Output>, BridgeError>;
}

/// Fixed-interval polling bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_wait: Duration,
    /// Consecutive transport or non-2xx failures tolerated before giving up.
    /// `u32::MAX` keeps polling through failures until `max_wait`.
    pub max_consecutive_failures: u32,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(180),
            max_consecutive_failures: 5,
        }
    }
}

fn cancelled(provider: &str) -> BridgeError {
    BridgeError::Cancelled {
        provider: provider.to_string(),
    }
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(CancellationToken::is_cancelled)
}

/// Sleep for `delay`, returning false if `token` fired first.
pub async fn sleep_or_cancel(delay: Duration, token: Option<&CancellationToken>) -> bool {
    match token {
        Some(t) => {
            tokio::select! {
                _ = t.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

pub struct PollDispatch<'a> {
    http: &'a HttpDispatch,
}

impl<'a> PollDispatch<'a> {
    pub fn new(http: &'a HttpDispatch) -> Self {
        Self { http }
    }

    /// Poll `handle` until the job completes, fails, `max_wait` passes, or `cancel` fires.
    ///
    /// The first poll goes out immediately; each later poll follows one `interval`
    /// sleep. Cancellation is checked after every network wait and raced with
    /// every sleep. 401/403 and non-transient send errors fail fast regardless of
    /// the failure budget.
    pub async fn run<A: PollApi>(
        &self,
        api: &A,
        handle: &OperationHandle,
        schedule: &PollSchedule,
        cancel: Option<&CancellationToken>,
    ) -> Result<A::Output, BridgeError> {
        let provider = api.provider();
        let start = Instant::now();
        let mut attempt: u32 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            if is_cancelled(cancel) {
                return Err(cancelled(provider));
            }
            attempt += 1;

            let spec = api.build_poll_request(handle);
            let result = self.http.send(provider, &spec).await;

            if is_cancelled(cancel) {
                return Err(cancelled(provider));
            }

            match result {
                Ok(reply) if reply.is_success() => {
                    consecutive_failures = 0;
                    match api.parse_poll_response(&reply.body)? {
                        PollStatus::Completed(output) => {
                            tracing::info!(
                                provider = provider,
                                job_id = handle.as_str(),
                                attempts = attempt,
                                elapsed_ms = start.elapsed().as_millis() as u64,
                                "polled job completed"
                            );
                            return Ok(output);
                        }
                        PollStatus::Failed(status) => {
                            tracing::warn!(
                                provider = provider,
                                job_id = handle.as_str(),
                                status = status.as_str(),
                                "polled job failed"
                            );
                            return Err(BridgeError::JobFailed {
                                provider: provider.to_string(),
                                status,
                            });
                        }
                        PollStatus::InProgress => {
                            tracing::debug!(
                                provider = provider,
                                job_id = handle.as_str(),
                                attempt = attempt,
                                "job still in progress"
                            );
                        }
                    }
                }
                Ok(reply) => {
                    // Auth failures during poll are not transient
                    if matches!(reply.status, 401 | 403) {
                        return Err(reply.into_error(provider));
                    }
                    consecutive_failures += 1;
                    tracing::warn!(
                        provider = provider,
                        job_id = handle.as_str(),
                        status = reply.status,
                        failures = consecutive_failures,
                        "poll returned non-success status"
                    );
                    if consecutive_failures >= schedule.max_consecutive_failures {
                        return Err(reply.into_error(provider));
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        provider = provider,
                        job_id = handle.as_str(),
                        failures = consecutive_failures,
                        "poll request failed: {e}"
                    );
                    if !e.is_retryable()
                        || consecutive_failures >= schedule.max_consecutive_failures
                    {
                        return Err(e);
                    }
                }
            }

            if !sleep_or_cancel(schedule.interval, cancel).await {
                return Err(cancelled(provider));
            }

            if start.elapsed() >= schedule.max_wait {
                return Err(BridgeError::Timeout {
                    provider: provider.to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_or_cancel_reports_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(10), Some(&token)).await);
    }

    #[tokio::test]
    async fn sleep_or_cancel_completes_without_token() {
        assert!(sleep_or_cancel(Duration::from_millis(1), None).await);
    }
}
