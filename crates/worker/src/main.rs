//! TokenRelay Worker - Main Entry Point
//!
//! Loads the configuration, builds the compute strategy and serves the
//! model service until ctrl-c.

use anyhow::Context;
use tokenrelay_common::config::ObservabilityConfig;
use tokenrelay_common::{RelayConfig, METRICS};
use tokenrelay_worker::{strategy, GenerationService, WorkerServer};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration comes first so it can pick the log level
    let config = match std::env::var("TOKENRELAY_CONFIG") {
        Ok(path) => RelayConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        Err(_) => RelayConfig::from_env().context("Failed to load configuration from environment")?,
    };

    init_logging(&config.observability);

    info!("Starting TokenRelay Worker");
    info!(
        "Worker configuration loaded: strategy={:?}, model={}, bind={}",
        config.strategy,
        config.model_name,
        config.listen_address()
    );

    let strategy = strategy::from_config(&config).context("Failed to build compute strategy")?;
    let service = GenerationService::new(
        strategy,
        config.stream.channel_capacity,
        METRICS.clone(),
    );
    let server = WorkerServer::new(&config.bind_address, config.port)?;

    server
        .serve(service, async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Received shutdown signal");
        })
        .await
        .context("Worker gRPC server failed")?;

    debug!("Final metrics:\n{}", METRICS.gather());
    info!("TokenRelay Worker shutdown complete");
    Ok(())
}

fn init_logging(observability: &ObservabilityConfig) {
    let level = &observability.log_level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "tokenrelay_worker={level},tokenrelay_common={level},tonic=warn,h2=warn",
            level = level
        )
        .into()
    });

    if observability.structured_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
