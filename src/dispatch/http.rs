use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;

use crate::dispatch::retry::{Retried, RetryPolicy, parse_retry_after};
use crate::error::BridgeError;

/// Cap on buffered response bodies. Generated images arrive base64-encoded, so
/// this is larger than a text-only limit would be.
pub const MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024; // 32MB

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub enum MultipartValue {
    Text(String),
    File {
        bytes: Vec<u8>,
        file_name: String,
        mime_type: String,
    },
}

#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    /// Kept as plain data so a retry can rebuild the form.
    Multipart(Vec<(String, MultipartValue)>),
}

/// Everything needed to issue one HTTP request. Cloneable so retries resend the
/// identical payload.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub timeout: Duration,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Json(body),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn post_multipart(url: impl Into<String>, fields: Vec<(String, MultipartValue)>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Multipart(fields),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn bearer(self, api_key: &str) -> Self {
        self.header("Authorization", format!("Bearer {api_key}"))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Clamp the timeout so the request cannot outlive `deadline`.
    pub fn within(mut self, deadline: Instant) -> Self {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.timeout = self.timeout.min(remaining);
        self
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self, provider: &str) -> Result<T, BridgeError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            BridgeError::decode(provider, format!("parse error: {e}; raw: {}", preview(&self.text())))
        })
    }

    pub fn into_error(self, provider: &str) -> BridgeError {
        BridgeError::Http {
            provider: provider.to_string(),
            status: self.status,
            body: self.text(),
        }
    }

    /// Pass 2xx replies through, turn everything else into `BridgeError::Http`.
    pub fn expect_success(self, provider: &str) -> Result<Self, BridgeError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.into_error(provider))
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(500).collect()
}

pub struct HttpDispatch {
    client: Client,
}

impl Default for HttpDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDispatch {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    fn build(&self, spec: &RequestSpec) -> Result<reqwest::RequestBuilder, BridgeError> {
        let mut builder = match spec.method {
            Method::Get => self.client.get(&spec.url),
            Method::Post => self.client.post(&spec.url),
        };
        for (k, v) in &spec.headers {
            builder = builder.header(k, v);
        }
        builder = builder.timeout(spec.timeout);

        let builder = match &spec.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Multipart(fields) => builder.multipart(build_form(fields)?),
        };
        Ok(builder)
    }

    /// Issue the request and return the response head without reading the body.
    /// Non-2xx statuses become `BridgeError::Http` (body included).
    pub async fn open(
        &self,
        provider: &str,
        spec: &RequestSpec,
    ) -> Result<reqwest::Response, BridgeError> {
        let start = Instant::now();
        let response = self
            .build(spec)?
            .send()
            .await
            .map_err(|e| map_send_error(provider, e, start))?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await.unwrap_or_default();
            let truncated = &bytes[..bytes.len().min(MAX_RESPONSE_BYTES)];
            return Err(BridgeError::Http {
                provider: provider.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(truncated).into_owned(),
            });
        }
        Ok(response)
    }

    /// Issue one request and buffer the whole response, whatever its status.
    pub async fn send(&self, provider: &str, spec: &RequestSpec) -> Result<HttpReply, BridgeError> {
        let start = Instant::now();

        tracing::debug!(provider = provider, url = spec.url.as_str(), "sending request");

        let response = self
            .build(spec)?
            .send()
            .await
            .map_err(|e| map_send_error(provider, e, start))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Enforce response size limit before buffering when the server declares it
        if let Some(len) = response.content_length()
            && len as usize > MAX_RESPONSE_BYTES
        {
            return Err(BridgeError::decode(
                provider,
                format!("response too large: {len} bytes (max {MAX_RESPONSE_BYTES})"),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_send_error(provider, e, start))?;

        if body.len() > MAX_RESPONSE_BYTES {
            return Err(BridgeError::decode(
                provider,
                format!(
                    "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                    body.len()
                ),
            ));
        }

        tracing::debug!(
            provider = provider,
            status = status,
            bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "response received"
        );

        Ok(HttpReply {
            status,
            retry_after,
            content_type,
            body: body.to_vec(),
        })
    }

    /// Send and require a 2xx reply.
    pub async fn send_ok(&self, provider: &str, spec: &RequestSpec) -> Result<HttpReply, BridgeError> {
        self.send(provider, spec).await?.expect_success(provider)
    }

    /// Send with backoff on 429/503/504. Other failures are returned immediately.
    /// Delays never shrink between consecutive retries.
    pub async fn send_with_retry(
        &self,
        provider: &str,
        spec: &RequestSpec,
        policy: &RetryPolicy,
    ) -> Result<Retried<HttpReply>, BridgeError> {
        let mut delays: Vec<Duration> = Vec::new();
        let mut retries: u32 = 0;

        loop {
            if !policy.min_delay_between_requests.is_zero() {
                tokio::time::sleep(policy.min_delay_between_requests).await;
            }

            let reply = self.send(provider, spec).await?;
            if reply.is_success() {
                return Ok(Retried {
                    value: reply,
                    delays,
                });
            }

            if policy.should_retry(reply.status, retries) {
                retries += 1;
                let floor = delays.last().copied().unwrap_or(Duration::ZERO);
                let delay = policy.delay_for(retries, reply.retry_after).max(floor);
                tracing::warn!(
                    provider = provider,
                    status = reply.status,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    "throttled, retrying"
                );
                tokio::time::sleep(delay).await;
                delays.push(delay);
                continue;
            }

            return Err(reply.into_error(provider));
        }
    }

    /// GET a binary resource (image download, `/view`), requiring 2xx.
    pub async fn get_bytes(
        &self,
        provider: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, BridgeError> {
        let reply = self
            .send_ok(provider, &RequestSpec::get(url).timeout(timeout))
            .await?;
        Ok(reply.body)
    }
}

fn build_form(fields: &[(String, MultipartValue)]) -> Result<Form, BridgeError> {
    let mut form = Form::new();
    for (name, value) in fields {
        form = match value {
            MultipartValue::Text(text) => form.text(name.clone(), text.clone()),
            MultipartValue::File {
                bytes,
                file_name,
                mime_type,
            } => {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime_type)?;
                form.part(name.clone(), part)
            }
        };
    }
    Ok(form)
}

fn map_send_error(provider: &str, e: reqwest::Error, start: Instant) -> BridgeError {
    if e.is_timeout() {
        BridgeError::Timeout {
            provider: provider.to_string(),
            waited_ms: start.elapsed().as_millis() as u64,
        }
    } else {
        BridgeError::Request(e)
    }
}
