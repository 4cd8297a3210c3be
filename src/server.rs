use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};

use crate::config::Config;
use crate::dispatch::TextRequest;
use crate::dispatch::registry::{ImageRequest, Registry};
use crate::error::BridgeError;
use crate::response::{ToolMetadata, ToolResponse};
use crate::tools::chat::ChatRequest;
use crate::tools::image::GenerateImageRequest;
use crate::tools::listproviders::{ListProvidersResponse, ProviderInfo};
use crate::tools::speak::SpeakRequest;
use crate::tools::{validate_dimension, validate_prompt, validate_temperature};

/// Chat replies get 5 min.
const CHAT_DEADLINE: Duration = Duration::from_secs(300);
/// Image jobs include queueing on a local GPU; 10 min is the MCP ceiling.
const IMAGE_DEADLINE: Duration = Duration::from_secs(600);
const SPEECH_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct PolarAiServer {
    registry: Arc<Registry>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl PolarAiServer {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(Registry::from_config(config)),
            tool_router: Self::tool_router(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[tool(
        name = "chat",
        description = "Send a prompt to a text model (xai, groq, gemini, ollama, openai) and return its reply. Use `listproviders` to see which backends are configured.",
        annotations(read_only_hint = true)
    )]
    async fn chat(
        &self,
        Parameters(req): Parameters<ChatRequest>,
    ) -> Result<CallToolResult, McpError> {
        validate_prompt(&req.prompt).map_err(|msg| McpError::invalid_params(msg, None))?;
        validate_temperature(req.temperature).map_err(|msg| McpError::invalid_params(msg, None))?;

        let kind = req.provider_or_default();
        let start = Instant::now();
        let text_req = TextRequest {
            model: req.model(),
            prompt: req.prompt,
            system_prompt: req.system_prompt,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            deadline: start + CHAT_DEADLINE,
            cancellation_token: None,
        };

        let response = match self.registry.chat(kind, &text_req).await {
            Ok(reply) => {
                let mut meta = ToolMetadata::new(
                    "chat",
                    &reply.provider,
                    &reply.model,
                    start.elapsed().as_secs_f64(),
                );
                meta.partial = reply.partial;
                ToolResponse::success(reply.text, meta)
            }
            Err(e) => failure("chat", kind.as_str(), &e, start),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "generate_image",
        description = "Generate an image with comfyui (local), xai, gemini, openai or fal and save it to the output directory. Returns the file path. Gemini edits or blends `input_images` when given."
    )]
    async fn generate_image(
        &self,
        Parameters(req): Parameters<GenerateImageRequest>,
    ) -> Result<CallToolResult, McpError> {
        validate_prompt(&req.prompt).map_err(|msg| McpError::invalid_params(msg, None))?;
        validate_dimension("width", req.width).map_err(|msg| McpError::invalid_params(msg, None))?;
        validate_dimension("height", req.height)
            .map_err(|msg| McpError::invalid_params(msg, None))?;

        let kind = req.provider_or_default();
        let start = Instant::now();
        let image_req = ImageRequest {
            prompt: req.prompt,
            negative_prompt: req.negative_prompt,
            width: req.width,
            height: req.height,
            steps: req.steps,
            seed: req.seed,
            checkpoint: req.checkpoint,
            loras: req.loras.unwrap_or_default(),
            endpoint: req.endpoint,
            input_images: req
                .input_images
                .unwrap_or_default()
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            deadline: start + IMAGE_DEADLINE,
        };

        let response = match self.registry.generate_image(kind, &image_req).await {
            Ok(saved) => ToolResponse::file(
                &saved.path,
                ToolMetadata::new(
                    "generate_image",
                    saved.provider,
                    &saved.model,
                    start.elapsed().as_secs_f64(),
                ),
            ),
            Err(e) => failure("generate_image", kind.as_str(), &e, start),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "speak",
        description = "Synthesize speech with ElevenLabs. The audio file is written to the cache directory and its path returned."
    )]
    async fn speak(
        &self,
        Parameters(req): Parameters<SpeakRequest>,
    ) -> Result<CallToolResult, McpError> {
        if req.text.trim().is_empty() {
            return Err(McpError::invalid_params("text must not be empty", None));
        }

        let start = Instant::now();
        let response = match self
            .registry
            .speak(&req.text, req.voice_id.as_deref(), start + SPEECH_DEADLINE)
            .await
        {
            Ok(path) => ToolResponse::file(
                &path,
                ToolMetadata::new("speak", "elevenlabs", "tts", start.elapsed().as_secs_f64()),
            ),
            Err(e) => failure("speak", "elevenlabs", &e, start),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "listproviders",
        description = "List backends with their capabilities and whether they are configured.",
        annotations(read_only_hint = true)
    )]
    async fn listproviders(&self) -> Result<CallToolResult, McpError> {
        let providers = self
            .registry
            .list_providers()
            .iter()
            .map(ProviderInfo::from)
            .collect();
        let content = ListProvidersResponse { providers }.to_markdown();

        let response = ToolResponse::markdown(
            content,
            ToolMetadata::new("listproviders", "none", "none", 0.0),
        );
        Ok(response.into_call_tool_result())
    }
}

fn failure(tool: &str, provider: &str, e: &BridgeError, start: Instant) -> ToolResponse {
    tracing::warn!(tool, provider, "tool call failed: {e}");
    ToolResponse::error(
        e.user_message(),
        ToolMetadata::new(
            tool,
            e.provider().unwrap_or(provider),
            "none",
            start.elapsed().as_secs_f64(),
        ),
    )
}

#[tool_handler]
impl ServerHandler for PolarAiServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "polarai".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "PolarAI: one bridge to several AI backends.\n\n\
                 1. Call `listproviders` to see which backends are configured.\n\
                 2. `chat` for text (xai is the default provider).\n\
                 3. `generate_image` for pictures (comfyui is the default; results are file paths).\n\
                 4. `speak` for ElevenLabs speech.\n\
                 Provider failures come back as `\"status\": \"error\"` with a readable message."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
