//! Telemetry worker: consumes the main stream as one member of a consumer group.
//!
//! ## Configuration
//!
//! - `TELEMETRY_CONFIG`: path to the TOML config (default: `config/telemetry.toml`)
//! - `REDIS_URL`: overrides `broker.url`
//! - `RUST_LOG`: logging level (default: "info")
//!
//! The consumer name comes from `processor.name`, else the hostname, else a
//! random id. Two workers must never share a name within one group.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_pipeline::metrics::{self, Metrics};
use telemetry_pipeline::shutdown::ShutdownSignal;
use telemetry_pipeline::worker::consumer_name;
use telemetry_pipeline::{
    AnomalyDetector, PipelineConfig, RedisStream, Worker, WorkerError, WorkerSettings,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::load()?;
    let consumer = consumer_name(config.processor.name.as_deref());

    info!(
        consumer = %consumer,
        consumer_group = %config.processor.consumer_group,
        stream = %config.broker.stream_name,
        dlq_stream = %config.broker.dlq_stream_name,
        "Telemetry worker starting"
    );

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.processor.metrics_port));
    metrics::install_listener(metrics_addr)?;
    info!(addr = %metrics_addr, "Metrics exporter listening");

    let stream = Arc::new(RedisStream::connect(&config.broker.url)?);
    let settings = WorkerSettings::from_config(&config, consumer);
    let detector = AnomalyDetector::new(
        config.processor.vibration_threshold,
        config.processor.physical_ceiling,
    );
    let worker = Arc::new(Worker::new(stream, settings, detector, Arc::new(Metrics::new()))?);

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.listen_for_signals().await });

    // The group must exist before consuming; keep trying while the broker is down.
    loop {
        match worker.prepare().await {
            Ok(()) => break,
            Err(WorkerError::Broker(e)) => {
                warn!(error = %e, "Broker unavailable, retrying consumer group setup");
                tokio::select! {
                    _ = tokio::time::sleep(worker.settings().broker_retry_backoff) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    let reclaimer = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run_reclaimer(shutdown).await })
    };

    worker.run(shutdown).await;

    if let Err(e) = reclaimer.await {
        error!(error = %e, "Reclaim task panicked");
    }

    info!("Telemetry worker shut down gracefully");
    Ok(())
}
