use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ApiKey;
use crate::dispatch::async_poll::{PollApi, PollDispatch, PollSchedule, PollStatus};
use crate::dispatch::channel::{self, WsStream};
use crate::dispatch::http::{HttpDispatch, HttpReply, MultipartValue, RequestSpec};
use crate::dispatch::stream::{StreamOutcome, StreamStep, read_sse};
use crate::dispatch::{ChatMessage, OperationHandle, TextReply, TextRequest};
use crate::error::BridgeError;
use crate::media::ImageData;
use crate::parsers::{response_field, string_value};
use crate::providers::{join_url, secs};

pub const PROVIDER: &str = "openai";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

const ASSISTANTS_BETA: &str = "assistants=v2";
const REALTIME_BETA: &str = "realtime=v1";
const RAG_MAX_OUTPUT_TOKENS: u64 = 800;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub api_key: ApiKey,
    pub organization_id: String,
    pub project_id: String,
    pub base_url: String,
    pub chat_model: String,
    pub json_mode_model: String,
    pub vision_model: String,
    pub image_model: String,
    pub whisper_model: String,
    pub realtime_model: String,
    /// Model behind vector-store answers and assistants.
    pub rag_model: String,
    pub timeout_secs: u64,
    pub poll_interval_secs: f64,
    pub max_wait_secs: f64,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            organization_id: String::new(),
            project_id: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            json_mode_model: "gpt-4o-mini".to_string(),
            vision_model: "gpt-4o-mini".to_string(),
            image_model: "gpt-image-1".to_string(),
            whisper_model: "whisper-1".to_string(),
            realtime_model: "gpt-4o-realtime-preview".to_string(),
            rag_model: "gpt-4o-mini".to_string(),
            timeout_secs: 120,
            poll_interval_secs: 1.2,
            max_wait_secs: 300.0,
        }
    }
}

impl OpenAiSettings {
    fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            interval: secs(self.poll_interval_secs),
            max_wait: secs(self.max_wait_secs),
            ..PollSchedule::default()
        }
    }

    /// Auth and account headers sent on every call.
    fn auth_headers(&self) -> Result<Vec<(String, String)>, BridgeError> {
        let key = self.api_key.require(PROVIDER, API_KEY_ENV)?;
        let mut headers = vec![("Authorization".to_string(), format!("Bearer {key}"))];
        if !self.organization_id.is_empty() {
            headers.push(("OpenAI-Organization".to_string(), self.organization_id.clone()));
        }
        if !self.project_id.is_empty() {
            headers.push(("OpenAI-Project".to_string(), self.project_id.clone()));
        }
        Ok(headers)
    }
}

// ---------------------------------------------------------------------------
// Usage accounting
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Running token totals across every Responses API call of one client.
#[derive(Debug, Default)]
pub struct UsageTotals {
    input: AtomicU64,
    output: AtomicU64,
}

impl UsageTotals {
    pub fn add(&self, usage: Usage) {
        self.input.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output.fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    /// Record the `usage` object of a response body, if it has one.
    pub fn record(&self, body: &Value) {
        if let Some(usage) = body
            .get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        {
            self.add(usage);
        }
    }

    pub fn snapshot(&self) -> Usage {
        Usage {
            input_tokens: self.input.load(Ordering::Relaxed),
            output_tokens: self.output.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<Value>,
}

/// Text of a Responses API body: the `output_text` convenience field, else
/// every `output[].content[].text` joined in order.
pub fn response_text(body: &Value) -> Option<String> {
    if let Some(text) = body.get("output_text").and_then(Value::as_str)
        && !text.is_empty()
    {
        return Some(text.to_string());
    }

    let joined: String = body
        .get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    (!joined.is_empty()).then_some(joined)
}

/// One chat-completions SSE event to a stream step.
pub fn parse_chat_delta(data: &str) -> Result<StreamStep, BridgeError> {
    let v: Value = serde_json::from_str(data)
        .map_err(|e| BridgeError::decode(PROVIDER, format!("bad stream event: {e}")))?;
    let delta = v
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok(StreamStep { delta, done: false })
}

/// Newest message text from `GET /threads/{id}/messages?order=desc&limit=1`.
fn latest_message_text(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/data/0/content/0/text/value")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| string_value(body, "value"))
}

fn required_id(reply: &HttpReply, what: &str) -> Result<String, BridgeError> {
    let body = reply.text();
    response_field(&body, "id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BridgeError::decode(PROVIDER, format!("{what}: no id in response; raw: {body}")))
}

// ---------------------------------------------------------------------------
// Polled jobs
// ---------------------------------------------------------------------------

/// Status poll for assistants-v2 objects (file batches, runs).
struct StatusPoll {
    url: String,
    headers: Vec<(String, String)>,
    /// Terminal statuses that count as failure. Note OpenAI spells it
    /// `canceled` for batches and `cancelled` for runs.
    failed: &'static [&'static str],
}

impl PollApi for StatusPoll {
    type Output = ();

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn build_poll_request(&self, _handle: &OperationHandle) -> RequestSpec {
        RequestSpec::get(self.url.clone()).headers(self.headers.iter().cloned())
    }

    fn parse_poll_response(&self, body: &[u8]) -> Result<PollStatus<()>, BridgeError> {
        let status = response_field(&String::from_utf8_lossy(body), "status")
            .ok_or_else(|| BridgeError::decode(PROVIDER, "poll response has no status"))?;
        Ok(if status == "completed" {
            PollStatus::Completed(())
        } else if self.failed.iter().any(|f| *f == status) {
            PollStatus::Failed(status)
        } else {
            PollStatus::InProgress
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    settings: OpenAiSettings,
    http: Arc<HttpDispatch>,
    usage: UsageTotals,
}

impl OpenAiClient {
    pub fn new(settings: OpenAiSettings, http: Arc<HttpDispatch>) -> Self {
        Self {
            settings,
            http,
            usage: UsageTotals::default(),
        }
    }

    pub fn settings(&self) -> &OpenAiSettings {
        &self.settings
    }

    pub fn usage(&self) -> Usage {
        self.usage.snapshot()
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.settings.base_url, path)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    fn post(&self, path: &str, body: Value) -> Result<RequestSpec, BridgeError> {
        Ok(RequestSpec::post_json(self.url(path), body)
            .headers(self.settings.auth_headers()?)
            .timeout(self.timeout()))
    }

    fn beta_headers(&self) -> Result<Vec<(String, String)>, BridgeError> {
        let mut headers = self.settings.auth_headers()?;
        headers.push(("OpenAI-Beta".to_string(), ASSISTANTS_BETA.to_string()));
        Ok(headers)
    }

    async fn post_beta(&self, path: &str, body: Value) -> Result<HttpReply, BridgeError> {
        let spec = RequestSpec::post_json(self.url(path), body)
            .headers(self.beta_headers()?)
            .timeout(self.timeout());
        self.http.send_ok(PROVIDER, &spec).await
    }

    async fn responses(
        &self,
        request: &ResponsesRequest<'_>,
        deadline: Option<Instant>,
    ) -> Result<String, BridgeError> {
        let body = serde_json::to_value(request)
            .map_err(|e| BridgeError::InvalidRequest(format!("unserializable request: {e}")))?;
        let mut spec = self.post("/responses", body)?;
        if let Some(deadline) = deadline {
            spec = spec.within(deadline);
        }

        let reply = self.http.send_ok(PROVIDER, &spec).await?;
        let value: Value = reply.json(PROVIDER)?;
        self.usage.record(&value);
        tracing::debug!(provider = PROVIDER, model = request.model, "responses call done");

        response_text(&value).ok_or_else(|| {
            BridgeError::decode(PROVIDER, format!("response has no output text; raw: {}", reply.text()))
        })
    }

    // -- Responses API ------------------------------------------------------

    pub async fn respond(&self, input: &str) -> Result<String, BridgeError> {
        self.responses(
            &ResponsesRequest {
                model: &self.settings.chat_model,
                input: json!(input),
                ..Default::default()
            },
            None,
        )
        .await
    }

    /// JSON mode. The model is told to emit one JSON object, which is parsed.
    pub async fn respond_json(&self, input: &str) -> Result<Value, BridgeError> {
        let text = self
            .responses(
                &ResponsesRequest {
                    model: &self.settings.json_mode_model,
                    input: json!(input),
                    text: Some(json!({ "format": { "type": "json_object" } })),
                    ..Default::default()
                },
                None,
            )
            .await?;
        serde_json::from_str(&text)
            .map_err(|e| BridgeError::decode(PROVIDER, format!("JSON mode reply is not JSON: {e}")))
    }

    pub async fn describe_image(&self, question: &str, image_url: &str) -> Result<String, BridgeError> {
        if image_url.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("image url is empty".to_string()));
        }
        let input = json!([{
            "role": "user",
            "content": [
                { "type": "input_text", "text": question },
                { "type": "input_image", "image_url": image_url }
            ]
        }]);
        self.responses(
            &ResponsesRequest {
                model: &self.settings.vision_model,
                input,
                ..Default::default()
            },
            None,
        )
        .await
    }

    pub async fn complete(&self, req: &TextRequest) -> Result<TextReply, BridgeError> {
        let model = req.model.as_deref().unwrap_or(&self.settings.chat_model);
        let text = self
            .responses(
                &ResponsesRequest {
                    model,
                    input: json!(req.prompt),
                    instructions: req.system_prompt.as_deref().filter(|s| !s.trim().is_empty()),
                    temperature: req.temperature,
                    max_output_tokens: req.max_tokens,
                    ..Default::default()
                },
                Some(req.deadline),
            )
            .await?;
        Ok(TextReply {
            text,
            model: model.to_string(),
            provider: PROVIDER.to_string(),
            partial: false,
        })
    }

    // -- Chat completions streaming -----------------------------------------

    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
        on_delta: &mut (dyn FnMut(&str) + Send),
    ) -> Result<StreamOutcome, BridgeError> {
        let body = json!({
            "model": self.settings.chat_model,
            "messages": messages,
            "stream": true,
        });
        let spec = self
            .post("/chat/completions", body)?
            .header("Accept", "text/event-stream");
        let response = self.http.open(PROVIDER, &spec).await?;
        read_sse(PROVIDER, response, deadline, cancel, parse_chat_delta, on_delta).await
    }

    // -- Images and audio ---------------------------------------------------

    pub async fn generate_image(&self, prompt: &str) -> Result<ImageData, BridgeError> {
        if prompt.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("prompt is empty".to_string()));
        }
        let body = json!({
            "model": self.settings.image_model,
            "prompt": prompt,
            "size": "1024x1024",
        });
        let reply = self
            .http
            .send_ok(PROVIDER, &self.post("/images/generations", body)?)
            .await?;
        let value: Value = reply.json(PROVIDER)?;

        let first = value.pointer("/data/0");
        if let Some(b64) = first.and_then(|d| d.get("b64_json")).and_then(Value::as_str) {
            return ImageData::from_base64(PROVIDER, b64);
        }
        if let Some(url) = first.and_then(|d| d.get("url")).and_then(Value::as_str) {
            let bytes = self.http.get_bytes(PROVIDER, url, self.timeout()).await?;
            return ImageData::from_bytes(PROVIDER, bytes);
        }
        Err(BridgeError::decode(PROVIDER, "no image data in response"))
    }

    /// Whisper transcription of a WAV recording.
    pub async fn transcribe(&self, wav: Vec<u8>, file_name: &str) -> Result<String, BridgeError> {
        if wav.is_empty() {
            return Err(BridgeError::InvalidRequest("no audio to transcribe".to_string()));
        }
        let fields = vec![
            (
                "model".to_string(),
                MultipartValue::Text(self.settings.whisper_model.clone()),
            ),
            (
                "file".to_string(),
                MultipartValue::File {
                    bytes: wav,
                    file_name: file_name.to_string(),
                    mime_type: "audio/wav".to_string(),
                },
            ),
        ];
        let spec = RequestSpec::post_multipart(self.url("/audio/transcriptions"), fields)
            .headers(self.settings.auth_headers()?)
            .timeout(self.timeout());
        let reply = self.http.send_ok(PROVIDER, &spec).await?;
        response_field(&reply.text(), "text")
            .ok_or_else(|| BridgeError::decode(PROVIDER, "transcription has no text"))
    }

    // -- Vector stores and assistants ---------------------------------------

    pub async fn create_vector_store(&self, name: &str) -> Result<String, BridgeError> {
        let reply = self.post_beta("/vector_stores", json!({ "name": name })).await?;
        let id = required_id(&reply, "create vector store")?;
        tracing::info!(provider = PROVIDER, vector_store = id.as_str(), "vector store created");
        Ok(id)
    }

    pub async fn upload_file(&self, path: &Path) -> Result<String, BridgeError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            BridgeError::InvalidRequest(format!("cannot read {}: {e}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        self.upload_bytes(bytes, &file_name).await
    }

    pub async fn upload_bytes(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, BridgeError> {
        let fields = vec![
            ("purpose".to_string(), MultipartValue::Text("assistants".to_string())),
            (
                "file".to_string(),
                MultipartValue::File {
                    bytes,
                    file_name: file_name.to_string(),
                    mime_type: "application/octet-stream".to_string(),
                },
            ),
        ];
        let spec = RequestSpec::post_multipart(self.url("/files"), fields)
            .headers(self.settings.auth_headers()?)
            .timeout(self.timeout());
        let reply = self.http.send_ok(PROVIDER, &spec).await?;
        let id = required_id(&reply, "upload file")?;
        tracing::info!(provider = PROVIDER, file = file_name, file_id = id.as_str(), "file uploaded");
        Ok(id)
    }

    pub async fn attach_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> Result<OperationHandle, BridgeError> {
        if file_ids.is_empty() {
            return Err(BridgeError::InvalidRequest("no file ids to attach".to_string()));
        }
        let reply = self
            .post_beta(
                &format!("/vector_stores/{vector_store_id}/file_batches"),
                json!({ "file_ids": file_ids }),
            )
            .await?;
        Ok(OperationHandle::new(required_id(&reply, "attach file batch")?))
    }

    /// Wait for a file batch to finish indexing. `failed`/`canceled` are errors.
    pub async fn poll_file_batch(
        &self,
        vector_store_id: &str,
        batch: &OperationHandle,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), BridgeError> {
        let api = StatusPoll {
            url: self.url(&format!("/vector_stores/{vector_store_id}/file_batches/{batch}")),
            headers: self.beta_headers()?,
            failed: &["failed", "canceled"],
        };
        PollDispatch::new(&self.http)
            .run(&api, batch, &self.settings.poll_schedule(), cancel)
            .await
    }

    /// Create a vector store, upload `paths` into it and wait for indexing.
    pub async fn build_vector_store(
        &self,
        name: &str,
        paths: &[&Path],
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        let store = self.create_vector_store(name).await?;
        let mut file_ids = Vec::with_capacity(paths.len());
        for path in paths {
            file_ids.push(self.upload_file(path).await?);
        }
        let batch = self.attach_file_batch(&store, &file_ids).await?;
        self.poll_file_batch(&store, &batch, cancel).await?;
        Ok(store)
    }

    /// Answer `question` from a vector store with the `file_search` tool.
    pub async fn ask_with_rag(&self, vector_store_id: &str, question: &str) -> Result<String, BridgeError> {
        self.responses(
            &ResponsesRequest {
                model: &self.settings.rag_model,
                input: json!([{ "role": "user", "content": question }]),
                tools: Some(json!([{
                    "type": "file_search",
                    "vector_store_ids": [vector_store_id]
                }])),
                max_output_tokens: Some(RAG_MAX_OUTPUT_TOKENS),
                ..Default::default()
            },
            None,
        )
        .await
    }

    pub async fn create_assistant(&self, vector_store_id: &str) -> Result<String, BridgeError> {
        let reply = self
            .post_beta(
                "/assistants",
                json!({
                    "model": self.settings.rag_model,
                    "tools": [{ "type": "file_search" }],
                    "tool_resources": { "file_search": { "vector_store_ids": [vector_store_id] } }
                }),
            )
            .await?;
        required_id(&reply, "create assistant")
    }

    /// Ask an existing assistant: new thread, one user message, one run polled
    /// to completion, then the newest message.
    pub async fn ask_assistant(
        &self,
        assistant_id: &str,
        question: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        if assistant_id.is_empty() {
            return Err(BridgeError::InvalidRequest("assistant id is empty".to_string()));
        }

        let thread = required_id(&self.post_beta("/threads", json!({})).await?, "create thread")?;
        self.post_beta(
            &format!("/threads/{thread}/messages"),
            json!({
                "role": "user",
                "content": [{ "type": "text", "text": question }]
            }),
        )
        .await?;
        let run = OperationHandle::new(required_id(
            &self
                .post_beta(
                    &format!("/threads/{thread}/runs"),
                    json!({ "assistant_id": assistant_id }),
                )
                .await?,
            "create run",
        )?);
        tracing::info!(provider = PROVIDER, job_id = run.as_str(), "assistant run started");

        let api = StatusPoll {
            url: self.url(&format!("/threads/{thread}/runs/{run}")),
            headers: self.beta_headers()?,
            failed: &["failed", "cancelled", "expired"],
        };
        PollDispatch::new(&self.http)
            .run(&api, &run, &self.settings.poll_schedule(), cancel)
            .await?;

        let spec = RequestSpec::get(self.url(&format!("/threads/{thread}/messages?order=desc&limit=1")))
            .headers(self.beta_headers()?)
            .timeout(self.timeout());
        let body = self.http.send_ok(PROVIDER, &spec).await?.text();
        latest_message_text(&body)
            .ok_or_else(|| BridgeError::decode(PROVIDER, format!("no message text; raw: {body}")))
    }

    pub async fn ask_via_assistants_run(
        &self,
        vector_store_id: &str,
        question: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        let assistant = self.create_assistant(vector_store_id).await?;
        self.ask_assistant(&assistant, question, cancel).await
    }

    // -- Realtime -------------------------------------------------------------

    pub async fn connect_realtime(&self) -> Result<RealtimeSession, BridgeError> {
        let base = channel::ws_url_from_http(&self.settings.base_url, "/realtime");
        let url = reqwest::Url::parse_with_params(&base, &[("model", &self.settings.realtime_model)])
            .map_err(|e| BridgeError::InvalidRequest(format!("bad realtime url: {e}")))?;

        let mut headers = self.settings.auth_headers()?;
        headers.push(("OpenAI-Beta".to_string(), REALTIME_BETA.to_string()));
        let ws = channel::connect(url.as_str(), &headers).await?;
        tracing::info!(provider = PROVIDER, model = self.settings.realtime_model.as_str(), "realtime connected");
        Ok(RealtimeSession::start(ws))
    }
}

/// A live realtime WebSocket. Server events are buffered in a bounded channel
/// and read with [`next_event`](Self::next_event).
pub struct RealtimeSession {
    sink: SplitSink<WsStream, Message>,
    events: mpsc::Receiver<Result<String, BridgeError>>,
    stop: CancellationToken,
}

impl RealtimeSession {
    fn start(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        let stop = CancellationToken::new();
        let events = channel::spawn_reader(stream, stop.clone());
        Self { sink, events, stop }
    }

    /// Ask the model for a response to `text`.
    pub async fn send_text(&mut self, text: &str) -> Result<(), BridgeError> {
        let event = json!({
            "type": "response.create",
            "response": { "instructions": text }
        });
        self.sink
            .send(Message::Text(event.to_string()))
            .await
            .map_err(|e| BridgeError::WebSocket(e.to_string()))
    }

    /// Next server event, or None once the socket is closed.
    pub async fn next_event(&mut self) -> Option<Result<Value, BridgeError>> {
        let text = match self.events.recv().await? {
            Ok(text) => text,
            Err(e) => return Some(Err(e)),
        };
        Some(
            serde_json::from_str(&text)
                .map_err(|e| BridgeError::decode(PROVIDER, format!("bad realtime event: {e}"))),
        )
    }

    pub async fn close(mut self) -> Result<(), BridgeError> {
        self.stop.cancel();
        self.sink
            .close()
            .await
            .map_err(|e| BridgeError::WebSocket(e.to_string()))
    }
}
