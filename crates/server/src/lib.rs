//! SplitInfer Server
//!
//! Network front end of the split-inference server. Connection I/O runs on
//! the tokio runtime; all model work is handed to one processor thread
//! through the [`WorkDistributor`].

pub mod connection;
pub mod monitor;

use splitinfer_common::{Result, SplitInferConfig, SplitInferError};
use splitinfer_proto::FrameLimits;
use splitinfer_worker::{ModelLoader, MonitorStats, Processor, WorkDistributor};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared server state; clones are cheap handles to the same server
#[derive(Clone)]
pub struct Server {
    config: Arc<SplitInferConfig>,
    distributor: WorkDistributor,
    monitor: Arc<MonitorStats>,
}

impl Server {
    pub fn new(config: SplitInferConfig) -> Self {
        let monitor = Arc::new(MonitorStats::new(config.monitor.history));
        Self {
            config: Arc::new(config),
            distributor: WorkDistributor::new(),
            monitor,
        }
    }

    pub fn config(&self) -> &SplitInferConfig {
        &self.config
    }

    pub fn distributor(&self) -> &WorkDistributor {
        &self.distributor
    }

    pub fn monitor(&self) -> Arc<MonitorStats> {
        self.monitor.clone()
    }

    /// Start the processor thread
    pub fn start_processor(&self, loader: Box<dyn ModelLoader>) -> Result<JoinHandle<()>> {
        let processor = Processor::new(
            self.distributor.clone(),
            loader,
            self.monitor.clone(),
            self.config.codec.quantization,
        );
        processor
            .spawn()
            .map_err(|e| SplitInferError::internal(format!("cannot start processor: {}", e)))
    }

    fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_frame_bytes: self.config.limits.max_frame_bytes,
            max_line_bytes: self.config.limits.max_line_bytes,
        }
    }

    /// Accept clients until the listener fails permanently
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        let limits = self.frame_limits();

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(connection::handle_client(
                        stream,
                        peer,
                        self.distributor.clone(),
                        limits,
                    ));
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }

    /// Serve monitor observers
    pub async fn serve_monitor(&self, listener: TcpListener) -> Result<()> {
        let expose_metrics = self
            .config
            .observability
            .as_ref()
            .map_or(true, |o| o.enable_metrics);
        monitor::serve_monitor(listener, self.monitor.clone(), expose_metrics).await
    }

    /// Stop the processor after the requests already queued
    pub fn shutdown(&self) {
        info!("Shutting down processor");
        self.distributor.shutdown();
    }
}
