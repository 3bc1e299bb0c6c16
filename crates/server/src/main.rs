//! SplitInfer Server - Main Entry Point
//!
//! Accepts split-inference clients, completes inference on a single
//! processor thread and streams per-frame statistics to monitor observers.

use anyhow::Context;
use splitinfer_common::{SplitInferConfig, METRICS};
use splitinfer_server::Server;
use splitinfer_worker::FileModelLoader;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "splitinfer_server=info,splitinfer_worker=info";

fn load_config() -> anyhow::Result<SplitInferConfig> {
    let config_path =
        std::env::var("SPLITINFER_CONFIG").unwrap_or_else(|_| "configs/server.yaml".to_string());

    if Path::new(&config_path).exists() {
        SplitInferConfig::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path))
    } else {
        SplitInferConfig::from_env().context("building configuration from environment")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Initialize logging
    let default_filter = match &config.observability {
        Some(o) => format!("splitinfer_server={0},splitinfer_worker={0}", o.log_level),
        None => DEFAULT_FILTER.to_string(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SplitInfer server");
    info!(
        "Configuration loaded: bind={}, models={}, monitor={}",
        config.listen_address(),
        config.models.root.display(),
        if config.monitor.enabled {
            config.monitor_address()
        } else {
            "disabled".to_string()
        }
    );

    let server = Server::new(config.clone());
    let worker = server.start_processor(Box::new(FileModelLoader::new(&config.models.root)))?;

    let listener = TcpListener::bind(config.listen_address())
        .await
        .with_context(|| format!("binding {}", config.listen_address()))?;

    if config.monitor.enabled {
        let monitor_listener = TcpListener::bind(config.monitor_address())
            .await
            .with_context(|| format!("binding {}", config.monitor_address()))?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_monitor(monitor_listener).await {
                error!("Monitor listener failed: {}", e);
            }
        });
    }

    info!("SplitInfer server running");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server.serve(listener) => {
            if let Err(e) = &result {
                error!("Listener failed: {}", e);
            }
            result?;
        }
    }

    server.shutdown();
    match tokio::task::spawn_blocking(move || worker.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("Processor thread panicked"),
        Err(e) => warn!("Could not join processor thread: {}", e),
    }

    debug!("Final metrics:\n{}", METRICS.gather());
    info!("SplitInfer server shutdown complete");
    Ok(())
}
