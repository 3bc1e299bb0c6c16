//! Configuration structures for SplitInfer
//!
//! Configurations are loaded from YAML files and can be replaced by environment
//! variables when no file is present.

use crate::error::{Result, SplitInferError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the serving process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitInferConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Inference protocol port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Monitoring listener configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Where split models are found
    pub models: ModelStoreConfig,

    /// Codec parameters shared by encoder and decoder
    #[serde(default)]
    pub codec: CodecConfig,

    /// Protocol limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Monitoring listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Serve the monitor stream at all
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,

    /// Monitor port
    #[serde(default = "default_monitor_port")]
    pub port: u16,

    /// Number of recent entries replayed to a new monitor client
    #[serde(default = "default_monitor_history")]
    pub history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            port: default_monitor_port(),
            history: default_monitor_history(),
        }
    }
}

/// Model store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStoreConfig {
    /// Directory holding `<model>/<layer>&<encoder>.json` descriptors
    pub root: PathBuf,
}

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Fallback quantization parameters for models that declare none
    #[serde(default)]
    pub quantization: QuantizationParams,

    /// JPEG quality used when a postencoder config omits it
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            quantization: QuantizationParams::default(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Uniform 8-bit quantization parameters.
///
/// `q = clamp(round(x / scale + zero_point), 0, 255)` and
/// `x = (q - zero_point) * scale`. Both ends of the link must agree on these;
/// they are never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParams {
    /// Step between adjacent quantization levels
    pub scale: f32,

    /// Level that represents 0.0
    pub zero_point: f32,
}

impl Default for QuantizationParams {
    fn default() -> Self {
        // Covers roughly [-4, 4]
        Self {
            scale: 8.0 / 255.0,
            zero_point: 127.5,
        }
    }
}

/// Protocol limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted data frame payload
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Largest accepted control line
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5678
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_monitor_port() -> u16 {
    5680
}

fn default_monitor_history() -> usize {
    256
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_line_bytes() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl SplitInferConfig {
    /// Create a configuration with defaults and the given model root
    pub fn with_models_root(root: impl Into<PathBuf>) -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            monitor: MonitorConfig::default(),
            models: ModelStoreConfig { root: root.into() },
            codec: CodecConfig::default(),
            limits: LimitsConfig::default(),
            observability: None,
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SplitInferError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: SplitInferConfig = serde_yaml::from_str(&content).map_err(|e| {
            SplitInferError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::with_models_root(
            std::env::var("SPLITINFER_MODELS_DIR").unwrap_or_else(|_| "models".to_string()),
        );

        if let Ok(addr) = std::env::var("SPLITINFER_BIND_ADDRESS") {
            config.bind_address = addr;
        }
        if let Ok(port) = std::env::var("SPLITINFER_PORT") {
            config.port = port
                .parse()
                .map_err(|_| SplitInferError::Config("Invalid port number".to_string()))?;
        }
        if let Ok(port) = std::env::var("SPLITINFER_MONITOR_PORT") {
            config.monitor.port = port
                .parse()
                .map_err(|_| SplitInferError::Config("Invalid monitor port number".to_string()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(SplitInferError::config("Port must be non-zero"));
        }
        if self.monitor.enabled && self.monitor.port == self.port {
            return Err(SplitInferError::config(format!(
                "Monitor port {} collides with the inference port",
                self.monitor.port
            )));
        }
        if self.models.root.as_os_str().is_empty() {
            return Err(SplitInferError::config("Model root must not be empty"));
        }

        let q = &self.codec.quantization;
        if !(q.scale.is_finite() && q.scale > 0.0) {
            return Err(SplitInferError::config(format!(
                "Quantization scale must be positive, got {}",
                q.scale
            )));
        }
        if !(0.0..=255.0).contains(&q.zero_point) {
            return Err(SplitInferError::config(format!(
                "Quantization zero point must lie in [0, 255], got {}",
                q.zero_point
            )));
        }
        if self.codec.jpeg_quality == 0 || self.codec.jpeg_quality > 100 {
            return Err(SplitInferError::config("JPEG quality must lie in [1, 100]"));
        }
        if self.limits.max_frame_bytes == 0 || self.limits.max_line_bytes == 0 {
            return Err(SplitInferError::config("Protocol limits must be non-zero"));
        }
        Ok(())
    }

    /// Socket address of the inference listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Socket address of the monitor listener
    pub fn monitor_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.monitor.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation() {
        let config = SplitInferConfig::with_models_root("/models");
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address(), "0.0.0.0:5678");
        assert_eq!(config.monitor_address(), "0.0.0.0:5680");
    }

    #[test]
    fn test_config_validation_port_collision() {
        let mut config = SplitInferConfig::with_models_root("/models");
        config.monitor.port = config.port;
        assert!(config.validate().is_err());

        config.monitor.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_quantization() {
        let mut config = SplitInferConfig::with_models_root("/models");
        config.codec.quantization.scale = 0.0;
        assert!(config.validate().is_err());

        let mut config = SplitInferConfig::with_models_root("/models");
        config.codec.quantization.zero_point = 300.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port: 7000\nmodels:\n  root: /srv/models\ncodec:\n  jpeg_quality: 75\n  quantization:\n    scale: 0.05\n    zero_point: 128\n"
        )
        .unwrap();

        let config = SplitInferConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.monitor.port, 5680);
        assert_eq!(config.codec.jpeg_quality, 75);
        assert_eq!(config.codec.quantization.zero_point, 128.0);
        assert_eq!(config.limits.max_frame_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_config_from_missing_file() {
        let result = SplitInferConfig::from_file("/nonexistent/server.yaml");
        assert!(matches!(result, Err(SplitInferError::Config(_))));
    }
}
