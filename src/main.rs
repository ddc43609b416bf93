//! Clinivox - media stream server for clinic voice calls
//!
//! Reads configuration from the environment, wires the speech, language
//! model and clinic API clients together and serves carrier media streams
//! until Ctrl-C.

#![forbid(unsafe_code)]

use anyhow::Context as _;
use clinivox::clinic_api::ClinicApiClient;
use clinivox::generator::ChatCompletionGenerator;
use clinivox::recorder::RecordingRoot;
use clinivox::synthesis::DeepgramSynthesizer;
use clinivox::transcription::DeepgramTranscriber;
use clinivox::{server, Config, SessionDeps, SessionRegistry, TurnServices};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting clinivox media stream server");

    let config = Config::from_env().context("invalid configuration")?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .context("failed to build HTTP client")?;

    let clinic = Arc::new(ClinicApiClient::new(http.clone(), config.clinic.clone()));
    let services = TurnServices {
        transcriber: Arc::new(DeepgramTranscriber::new(http.clone(), config.speech.clone())),
        generator: Arc::new(ChatCompletionGenerator::new(http.clone(), config.llm.clone())),
        synthesizer: Arc::new(DeepgramSynthesizer::new(http, config.speech.clone())),
    };

    let deps = SessionDeps {
        services,
        contexts: clinic.clone(),
        records: clinic,
        settings: config.stream.clone(),
        recordings: config.recordings_dir.as_ref().map(RecordingRoot::new),
        registry: SessionRegistry::new(),
    };

    info!(
        "Turn settings: buffer {:?}, timeout {:?}, greeting {}, model {}",
        config.stream.buffer, config.stream.turn_timeout, config.stream.greeting, config.llm.model
    );

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C");
    };

    server::run(listener, deps, shutdown).await?;
    info!("Server stopped");
    Ok(())
}
