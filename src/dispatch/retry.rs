use std::time::Duration;

/// HTTP statuses that are retried. Everything else non-2xx is terminal.
pub const RETRYABLE_STATUSES: [u16; 3] = [429, 503, 504];

/// Exponential backoff for throttled requests.
///
/// Retry `n` (1-based) waits `min(max_delay, base_delay * 2^(n-1))`. A numeric
/// `Retry-After` header raises that to at least the server's value. Every request,
/// including the first, is preceded by `min_delay_between_requests`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub min_delay_between_requests: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            min_delay_between_requests: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no pacing.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            min_delay_between_requests: Duration::ZERO,
        }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }

    /// Whether a reply with `status` should be retried after `retries_so_far` retries.
    pub fn should_retry(&self, status: u16, retries_so_far: u32) -> bool {
        Self::is_retryable_status(status) && retries_so_far < self.max_retries
    }

    /// Backoff for retry `retry` (1-based), before any `Retry-After` adjustment.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31) as i32;
        let delay = self.base_delay.mul_f64(2_f64.powi(exp));
        delay.min(self.max_delay)
    }

    /// Delay before retry `retry`, honoring the server's `Retry-After` when present.
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff_delay(retry);
        match retry_after {
            Some(ra) => backoff.max(ra),
            None => backoff,
        }
    }
}

/// A value obtained through [`RetryPolicy`], with the delays actually slept.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub delays: Vec<Duration>,
}

impl<T> Retried<T> {
    pub fn retries(&self) -> usize {
        self.delays.len()
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Parse a `Retry-After` header given in (possibly fractional) seconds.
/// HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
