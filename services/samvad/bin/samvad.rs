//! Main Entrypoint for the Samvad voice client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging.
//! 3. Loading figure content and building the Gemini backend and audio devices.
//! 4. Starting the session manager and handing the terminal to the shell.

use anyhow::Context;
use clap::Parser;
use samvad_core::VoiceProfile;
use samvad_core::content::{ContentProvider, StaticContent};
use samvad_service::{
    config::Config,
    devices::CpalDevices,
    gemini::GeminiBackend,
    manager::{LiveVoiceManager, UiCommand},
    shell,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "samvad")]
#[command(about = "Hold a live voice conversation with a historical figure")]
struct Args {
    /// Figure to open as soon as the shell starts.
    #[arg(long)]
    figure: Option<String>,

    /// Voice profile, `male` or `female`. Overrides SAMVAD_VOICE.
    #[arg(long)]
    voice: Option<VoiceProfile>,

    /// Path to the figure content JSON. Overrides SAMVAD_CONTENT_PATH.
    #[arg(long)]
    content: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Initializing voice client...");
    gemini_live::install_crypto_provider();

    // --- 3. Initialize Shared Services ---
    let content_path = args.content.unwrap_or(config.content_path.clone());
    let content: Arc<dyn ContentProvider> = Arc::new(
        StaticContent::from_path(&content_path)
            .with_context(|| format!("Failed to load figures from {}", content_path.display()))?,
    );
    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY is not set; sessions will fail with 'Missing API Key'");
    }
    let backend = Arc::new(GeminiBackend::new(
        config.gemini_api_key.take(),
        config.live_model.clone(),
        config.live_endpoint.clone(),
    ));
    let voice = args.voice.unwrap_or(config.voice);

    // --- 4. Start the Session Manager ---
    let handle =
        LiveVoiceManager::new(backend, Arc::new(CpalDevices), content.clone(), voice).spawn();
    if let Some(figure_id) = args.figure {
        handle.send(UiCommand::Open { figure_id })?;
    }

    shell::run(handle, content).await?;
    info!("Voice client stopped.");
    Ok(())
}
