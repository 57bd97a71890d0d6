//! Ingest server: accepts telemetry over HTTP and appends it to the main stream.
//!
//! ## Configuration
//!
//! - `TELEMETRY_CONFIG`: path to the TOML config (default: `config/telemetry.toml`)
//! - `REDIS_URL`: overrides `broker.url`
//! - `RUST_LOG`: logging level (default: "info")

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_pipeline::http::{app, AppState};
use telemetry_pipeline::metrics::{self, Metrics};
use telemetry_pipeline::shutdown::ShutdownSignal;
use telemetry_pipeline::{PipelineConfig, Producer, RedisStream, Stream, Validator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = PipelineConfig::load()?;

    let stream = Arc::new(RedisStream::connect(&config.broker.url)?);
    if let Err(e) = stream.ping().await {
        // Requests will get 503 until the broker is back.
        warn!(error = %e, "Broker not reachable at startup");
    }

    let handle = metrics::install_recorder()?;
    let producer = Producer::new(
        Validator::new(config.governance.allowed_types.iter().cloned()),
        stream,
        config.broker.stream_name.clone(),
        Arc::new(Metrics::new()),
    );

    if config.server.api_key.is_none() {
        warn!("No API key configured, /ingest is unauthenticated");
    }
    let state = AppState::new(producer)
        .with_metrics_handle(handle)
        .with_api_key(config.server.api_key.clone());

    let shutdown = ShutdownSignal::new();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        %addr,
        stream = %config.broker.stream_name,
        allowed_types = ?config.governance.allowed_types,
        "Ingest server listening"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.listen_for_signals().await });

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Ingest server stopped");
    Ok(())
}
