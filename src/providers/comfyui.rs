use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::dispatch::OperationHandle;
use crate::dispatch::async_poll::{PollApi, PollDispatch, PollSchedule, PollStatus};
use crate::dispatch::callback::{Progress, ProgressFn};
use crate::dispatch::channel::{self, ListenControl};
use crate::dispatch::http::{DEFAULT_REQUEST_TIMEOUT, HttpDispatch, RequestSpec};
use crate::error::BridgeError;
use crate::media::ImageData;
use crate::parsers::{ImageInfo, first_image_info};
use crate::providers::{join_url, secs};

pub const PROVIDER: &str = "comfyui";

const DEFAULT_FILENAME_PREFIX: &str = "PolarAI";
/// First node id handed to LoRA loaders; 2..=8 belong to the fixed graph.
const FIRST_LORA_NODE: u32 = 9;
/// Ceiling for time-based progress when no WebSocket is listening.
const PSEUDO_PROGRESS_CAP: f32 = 0.1;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComfyUiSettings {
    pub base_url: String,
    pub poll_interval_secs: f64,
    pub max_wait_secs: f64,
    pub client_id: String,
    pub use_websocket_progress: bool,
    /// Checkpoint used when a request leaves it empty.
    pub checkpoint: String,
}

impl Default for ComfyUiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".to_string(),
            poll_interval_secs: 1.0,
            max_wait_secs: 180.0,
            client_id: "PolarAI".to_string(),
            use_websocket_progress: true,
            checkpoint: String::new(),
        }
    }
}

impl ComfyUiSettings {
    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            interval: secs(self.poll_interval_secs),
            max_wait: secs(self.max_wait_secs),
            // A local server restarting mid-job is normal; only max_wait ends the wait.
            max_consecutive_failures: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoraEntry {
    pub lora_name: String,
    #[serde(default = "one")]
    pub model_strength: f32,
    #[serde(default = "one")]
    pub clip_strength: f32,
}

fn one() -> f32 {
    1.0
}

/// Parameters for the built-in text-to-image graph.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ComfyUiRequest {
    pub checkpoint: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f32,
    pub sampler_name: String,
    pub scheduler: String,
    pub denoise: f32,
    /// Negative picks a random seed.
    pub seed: i64,
    pub filename_prefix: String,

    /// Legacy single-LoRA fields, ignored when `loras` is non-empty.
    pub lora_name: String,
    pub lora_model_strength: f32,
    pub lora_clip_strength: f32,

    pub loras: Vec<LoraEntry>,
}

impl Default for ComfyUiRequest {
    fn default() -> Self {
        Self {
            checkpoint: String::new(),
            positive_prompt: String::new(),
            negative_prompt: String::new(),
            width: 512,
            height: 512,
            steps: 20,
            cfg: 7.0,
            sampler_name: "euler".to_string(),
            scheduler: "normal".to_string(),
            denoise: 1.0,
            seed: -1,
            filename_prefix: String::new(),
            lora_name: String::new(),
            lora_model_strength: 0.0,
            lora_clip_strength: 0.0,
            loras: Vec::new(),
        }
    }
}

impl ComfyUiRequest {
    /// LoRAs to chain, in order. Blank names are dropped.
    pub fn effective_loras(&self) -> Vec<LoraEntry> {
        if !self.loras.is_empty() {
            return self
                .loras
                .iter()
                .filter(|l| !l.lora_name.trim().is_empty())
                .map(|l| LoraEntry {
                    lora_name: l.lora_name.trim().to_string(),
                    ..l.clone()
                })
                .collect();
        }
        if self.lora_name.trim().is_empty() {
            return Vec::new();
        }
        let or_one = |s: f32| if s == 0.0 { 1.0 } else { s };
        vec![LoraEntry {
            lora_name: self.lora_name.trim().to_string(),
            model_strength: or_one(self.lora_model_strength),
            clip_strength: or_one(self.lora_clip_strength),
        }]
    }
}

/// Build the minimal text-to-image prompt graph.
///
/// Node ids: "2" checkpoint, "3"/"4" positive/negative text, "6" empty latent,
/// "5" KSampler, "7" VAE decode, "8" SaveImage. LoRA loaders take ids from 9
/// upward, each feeding the next, and the last one feeds the text encoders and
/// the sampler.
pub fn build_workflow(r: &ComfyUiRequest) -> Value {
    let seed = if r.seed >= 0 {
        r.seed
    } else {
        rand::rng().random_range(0..=i64::from(u32::MAX))
    };

    let mut graph = Map::new();
    graph.insert(
        "2".into(),
        json!({
            "inputs": { "ckpt_name": r.checkpoint },
            "class_type": "CheckpointLoaderSimple"
        }),
    );

    let mut source = "2".to_string();
    for (id, lora) in (FIRST_LORA_NODE..).zip(r.effective_loras()) {
        let id = id.to_string();
        graph.insert(
            id.clone(),
            json!({
                "inputs": {
                    "lora_name": lora.lora_name,
                    "strength_model": lora.model_strength,
                    "strength_clip": lora.clip_strength,
                    "model": [source, 0],
                    "clip": [source, 1]
                },
                "class_type": "LoraLoader"
            }),
        );
        source = id;
    }

    graph.insert(
        "3".into(),
        json!({
            "inputs": { "text": r.positive_prompt, "clip": [source, 1] },
            "class_type": "CLIPTextEncode"
        }),
    );
    graph.insert(
        "4".into(),
        json!({
            "inputs": { "text": r.negative_prompt, "clip": [source, 1] },
            "class_type": "CLIPTextEncode"
        }),
    );
    graph.insert(
        "6".into(),
        json!({
            "inputs": { "width": r.width, "height": r.height, "batch_size": 1 },
            "class_type": "EmptyLatentImage"
        }),
    );
    graph.insert(
        "5".into(),
        json!({
            "inputs": {
                "seed": seed,
                "steps": r.steps,
                "cfg": r.cfg,
                "sampler_name": r.sampler_name,
                "scheduler": r.scheduler,
                "denoise": r.denoise,
                "model": [source, 0],
                "positive": ["3", 0],
                "negative": ["4", 0],
                "latent_image": ["6", 0]
            },
            "class_type": "KSampler"
        }),
    );
    graph.insert(
        "7".into(),
        json!({
            "inputs": { "samples": ["5", 0], "vae": ["2", 2] },
            "class_type": "VAEDecode"
        }),
    );

    let prefix = if r.filename_prefix.trim().is_empty() {
        DEFAULT_FILENAME_PREFIX
    } else {
        r.filename_prefix.as_str()
    };
    graph.insert(
        "8".into(),
        json!({
            "inputs": { "images": ["7", 0], "filename_prefix": prefix },
            "class_type": "SaveImage"
        }),
    );

    Value::Object(graph)
}

// ---------------------------------------------------------------------------
// WebSocket progress
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsEnvelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Option<WsData>,
}

#[derive(Deserialize)]
struct WsData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    value: f32,
    #[serde(default)]
    max: f32,
    #[serde(default)]
    node: Option<String>,
}

/// Translate one `/ws` message into a progress report for `prompt_id`.
/// Messages for other prompts, unknown types and non-JSON frames give None.
pub fn progress_from_message(text: &str, prompt_id: &str) -> Option<Progress> {
    let env: WsEnvelope = serde_json::from_str(text).ok()?;
    let data = env.data?;
    if data.prompt_id.as_deref() != Some(prompt_id) {
        return None;
    }
    let node = data.node.filter(|n| !n.is_empty());

    match env.kind.as_str() {
        "progress" if data.max > 0.0 => {
            let suffix = node.map(|n| format!(" ({n})")).unwrap_or_default();
            Some(Progress::new(
                data.value / data.max,
                format!("step {}/{}{suffix}", data.value, data.max),
            ))
        }
        "executing" => Some(Progress::new(
            0.0,
            format!("executing node {}...", node.as_deref().unwrap_or("-")),
        )),
        "execution_end" => Some(Progress::new(1.0, "execution finished")),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// History polling
// ---------------------------------------------------------------------------

struct HistoryPoll<'a> {
    base_url: &'a str,
    started: Instant,
    max_wait: Duration,
    /// Set only when no WebSocket reports real progress.
    pseudo_progress: Option<ProgressFn>,
}

impl PollApi for HistoryPoll<'_> {
    type Output = ImageInfo;

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn build_poll_request(&self, handle: &OperationHandle) -> RequestSpec {
        RequestSpec::get(join_url(self.base_url, &format!("/history/{handle}")))
    }

    fn parse_poll_response(&self, body: &[u8]) -> Result<PollStatus<ImageInfo>, BridgeError> {
        if let Some(info) = first_image_info(&String::from_utf8_lossy(body)) {
            return Ok(PollStatus::Completed(info));
        }
        if let Some(report) = &self.pseudo_progress {
            let waited = self.started.elapsed().as_secs_f32();
            let span = self.max_wait.as_secs_f32().max(1.0);
            report(Progress::new(
                (waited / span).min(1.0) * PSEUDO_PROGRESS_CAP,
                "waiting for result...",
            ));
        }
        Ok(PollStatus::InProgress)
    }
}

#[derive(Deserialize)]
struct PromptIdResponse {
    #[serde(default)]
    prompt_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client for a ComfyUI server. One job at a time is expected;
/// `cancel_current` targets whichever job started last.
pub struct ComfyUiClient {
    settings: ComfyUiSettings,
    http: Arc<HttpDispatch>,
    current: Mutex<CancellationToken>,
}

impl ComfyUiClient {
    pub fn new(settings: ComfyUiSettings, http: Arc<HttpDispatch>) -> Self {
        Self {
            settings,
            http,
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn settings(&self) -> &ComfyUiSettings {
        &self.settings
    }

    /// Ask the running job to stop at its next suspension point.
    pub fn cancel_current(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        tracing::info!(provider = PROVIDER, "cancel requested");
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// Submit `request`, wait for the first output image and download it.
    pub async fn generate_image(
        &self,
        request: &ComfyUiRequest,
        progress: Option<ProgressFn>,
    ) -> Result<ImageData, BridgeError> {
        let cancel = self.fresh_token();
        let report = |fraction: f32, message: &str| {
            if let Some(p) = &progress {
                p(Progress::new(fraction, message));
            }
        };

        let mut request = request.clone();
        if request.checkpoint.trim().is_empty() {
            request.checkpoint = self.settings.checkpoint.clone();
        }
        if request.checkpoint.trim().is_empty() {
            return Err(BridgeError::InvalidRequest(
                "no checkpoint given and no default checkpoint configured".to_string(),
            ));
        }

        let body = json!({
            "prompt": build_workflow(&request),
            "client_id": self.settings.client_id,
        });
        let submit = RequestSpec::post_json(join_url(&self.settings.base_url, "/prompt"), body);

        report(0.0, "submitting job...");
        let reply = or_cancel(&cancel, self.http.send_ok(PROVIDER, &submit)).await?;
        let raw = reply.text();
        let prompt_id = reply
            .json::<PromptIdResponse>(PROVIDER)
            .ok()
            .and_then(|r| r.prompt_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                BridgeError::decode(PROVIDER, format!("response has no prompt_id; raw: {raw}"))
            })?;
        let handle = OperationHandle::new(prompt_id);
        tracing::info!(provider = PROVIDER, job_id = handle.as_str(), "prompt queued");

        let ws_stop = cancel.child_token();
        let listening = match (&progress, self.settings.use_websocket_progress) {
            (Some(p), true) => {
                self.spawn_progress_listener(handle.clone(), p.clone(), ws_stop.clone());
                true
            }
            _ => {
                report(0.0, "job queued, waiting...");
                false
            }
        };

        let schedule = self.settings.poll_schedule();
        let poll = HistoryPoll {
            base_url: &self.settings.base_url,
            started: Instant::now(),
            max_wait: schedule.max_wait,
            pseudo_progress: if listening { None } else { progress.clone() },
        };
        let found = PollDispatch::new(&self.http)
            .run(&poll, &handle, &schedule, Some(&cancel))
            .await;
        ws_stop.cancel();
        let info = found?;

        report(1.0, "generation finished, downloading image...");
        let view = reqwest::Url::parse_with_params(
            &join_url(&self.settings.base_url, "/view"),
            &[
                ("filename", info.filename.as_str()),
                ("subfolder", info.subfolder.as_str()),
                ("type", info.kind.as_str()),
            ],
        )
        .map_err(|e| BridgeError::InvalidRequest(format!("bad ComfyUI base url: {e}")))?;

        let bytes = or_cancel(
            &cancel,
            self.http
                .get_bytes(PROVIDER, view.as_str(), DEFAULT_REQUEST_TIMEOUT),
        )
        .await?;
        ImageData::from_bytes(PROVIDER, bytes)
    }

    fn spawn_progress_listener(
        &self,
        handle: OperationHandle,
        progress: ProgressFn,
        stop: CancellationToken,
    ) {
        let url = match reqwest::Url::parse_with_params(
            &channel::ws_url_from_http(&self.settings.base_url, "/ws"),
            &[("clientId", self.settings.client_id.as_str())],
        ) {
            Ok(url) => url.to_string(),
            Err(e) => {
                tracing::debug!(provider = PROVIDER, "no progress socket: {e}");
                return;
            }
        };
        tokio::spawn(async move {
            let ws = match channel::connect(&url, &[]).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::debug!(provider = PROVIDER, "progress socket unavailable: {e}");
                    return;
                }
            };
            let gate = stop.clone();
            let result = channel::listen(ws, stop, |text| {
                if gate.is_cancelled() {
                    return ListenControl::Stop;
                }
                if let Some(p) = progress_from_message(text, handle.as_str()) {
                    progress(p);
                }
                ListenControl::Continue
            })
            .await;
            if let Err(e) = result {
                tracing::debug!(provider = PROVIDER, "progress socket ended: {e}");
            }
        });
    }
}

/// Race `fut` against `token`.
async fn or_cancel<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, BridgeError>>,
) -> Result<T, BridgeError> {
    tokio::select! {
        _ = token.cancelled() => Err(BridgeError::Cancelled { provider: PROVIDER.to_string() }),
        r = fut => r,
    }
}
