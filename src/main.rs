use std::path::PathBuf;

use rmcp::{ServiceExt, transport::stdio};

use polarai::config::Config;
use polarai::server::PolarAiServer;

/// MCP clients launch us from arbitrary directories, so look next to the
/// binary (and the cargo project root for dev builds) before the CWD.
fn load_dotenv() {
    let candidates: Vec<PathBuf> = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .map(|dir| vec![dir.join(".env"), dir.join("../../.env")])
        .unwrap_or_default();

    match candidates.iter().find(|p| p.exists()) {
        Some(path) => {
            dotenvy::from_path(path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    load_dotenv();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "polarai starting");

    let config = Config::load()?;
    tracing::info!(
        output_dir = %config.output_dir.display(),
        comfyui = config.comfyui.base_url.as_str(),
        "config loaded"
    );
    let server = PolarAiServer::new(config);

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("polarai shutting down");
    Ok(())
}
