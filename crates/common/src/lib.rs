//! SplitInfer common library
//!
//! This crate contains shared code used across SplitInfer components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{QuantizationParams, SplitInferConfig};
pub use error::{ModelStateError, Result, SplitInferError};
pub use metrics::{MetricsRegistry, METRICS};
