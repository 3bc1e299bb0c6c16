//! Metrics collection for SplitInfer
//!
//! This module provides Prometheus metrics for observability.
//! Metric handles are cheap clones; updating them never blocks the worker.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for SplitInfer
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub processor: ProcessorMetrics,
    pub connections: ConnectionMetrics,
}

/// Metrics recorded by the serialized worker
#[derive(Debug, Clone)]
pub struct ProcessorMetrics {
    /// Total number of requests dequeued
    pub requests_total: IntCounter,

    /// Total number of predict requests that produced a result
    pub predictions_total: IntCounter,

    /// Total number of requests that failed
    pub requests_failed: IntCounter,

    /// Decode + inference duration
    pub inference_duration: Histogram,

    /// Predecoder duration alone
    pub decode_duration: Histogram,

    /// Current depth of the shared inbound queue
    pub queue_depth: IntGauge,

    /// Model configurations currently resident
    pub loaded_models: IntGauge,
}

/// Metrics recorded by the connection layer
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Connections accepted since start
    pub accepted_total: IntCounter,

    /// Connections currently open
    pub active: IntGauge,

    /// Frame payload bytes received
    pub bytes_received_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("metric options are static");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric names are unique");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("metric options are static");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric names are unique");
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("metric options are static");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric names are unique");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let processor = ProcessorMetrics {
            requests_total: counter(
                &registry,
                "processor_requests_total",
                "Total number of requests dequeued by the processor",
            ),
            predictions_total: counter(
                &registry,
                "processor_predictions_total",
                "Total number of predictions returned",
            ),
            requests_failed: counter(
                &registry,
                "processor_requests_failed_total",
                "Total number of failed requests",
            ),
            inference_duration: histogram(
                &registry,
                "processor_inference_duration_seconds",
                "Model forward pass and prediction decoding in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            ),
            decode_duration: histogram(
                &registry,
                "processor_decode_duration_seconds",
                "Predecoder duration in seconds",
                vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1],
            ),
            queue_depth: gauge(
                &registry,
                "processor_queue_depth",
                "Current depth of the shared inbound queue",
            ),
            loaded_models: gauge(
                &registry,
                "processor_loaded_models",
                "Model configurations currently loaded",
            ),
        };

        let connections = ConnectionMetrics {
            accepted_total: counter(
                &registry,
                "connections_accepted_total",
                "Total number of accepted connections",
            ),
            active: gauge(&registry, "connections_active", "Currently open connections"),
            bytes_received_total: counter(
                &registry,
                "connections_bytes_received_total",
                "Frame payload bytes received",
            ),
        };

        MetricsRegistry {
            registry,
            processor,
            connections,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.processor.requests_total.inc();
        metrics.connections.active.inc();
        metrics.processor.queue_depth.set(10);

        let output = metrics.gather();
        assert!(output.contains("processor_requests_total"));
        assert!(output.contains("processor_queue_depth 10"));
        assert!(output.contains("connections_active 1"));
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new();
        let value = metrics.processor.decode_duration.time(|| 7);
        assert_eq!(value, 7);
        assert_eq!(metrics.processor.decode_duration.get_sample_count(), 1);
    }
}
