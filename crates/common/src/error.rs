//! Common error types for SplitInfer
//!
//! This module defines all error types used across the serving path.
//! Every error carries a stable kind string so it can be reported back to the
//! connection that caused it.

use thiserror::Error;

/// Model state violations detected while driving a connection's session
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStateError {
    /// The session already holds a model configuration
    #[error("a model configuration is already acquired")]
    AlreadyAcquired,

    /// No model configuration is held (or the reference count is zero)
    #[error("model configuration is not acquired")]
    NotAcquired,

    /// Release named a configuration other than the one held
    #[error("released model configuration does not match the acquired one")]
    ConfigMismatch,
}

/// Main error type for SplitInfer
#[derive(Error, Debug)]
pub enum SplitInferError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed control message, unknown request tag or broken framing
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No codec exists for this combination
    #[error("Unknown codec: layer={layer}, encoder={encoder}, postencoder={postencoder}")]
    UnknownCodec {
        layer: String,
        encoder: String,
        postencoder: String,
    },

    /// Acquire/release/predict issued in the wrong session state
    #[error("Model state error: {0}")]
    ModelState(#[from] ModelStateError),

    /// Model loading errors (missing descriptor, missing weights)
    #[error("Model error: {0}")]
    Model(String),

    /// Corrupt compressed payload or byte-length/shape mismatch
    #[error("Codec error: {0}")]
    Codec(String),

    /// Tensor operation errors
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping errors
    #[error("Memory mapping error: {0}")]
    MemoryMap(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SplitInferError {
    /// Stable identifier reported to clients in error responses
    pub fn kind(&self) -> &'static str {
        match self {
            SplitInferError::Config(_) => "config",
            SplitInferError::Protocol(_) => "protocol",
            SplitInferError::UnknownCodec { .. } => "unknown_codec",
            SplitInferError::ModelState(ModelStateError::AlreadyAcquired) => "already_acquired",
            SplitInferError::ModelState(ModelStateError::NotAcquired) => "not_acquired",
            SplitInferError::ModelState(ModelStateError::ConfigMismatch) => "config_mismatch",
            SplitInferError::Model(_) => "model",
            SplitInferError::Codec(_) => "codec",
            SplitInferError::Tensor(_) => "tensor",
            SplitInferError::Serialization(_) => "serialization",
            SplitInferError::Io(_) => "io",
            SplitInferError::MemoryMap(_) => "memory_map",
            SplitInferError::InvalidInput(_) => "invalid_input",
            SplitInferError::Internal(_) => "internal",
        }
    }

    /// Whether the connection that triggered this error must be terminated.
    ///
    /// Everything else is scoped to the single request that failed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SplitInferError::Protocol(_) | SplitInferError::UnknownCodec { .. }
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SplitInferError::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        SplitInferError::Protocol(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        SplitInferError::Model(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        SplitInferError::Codec(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        SplitInferError::Tensor(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        SplitInferError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        SplitInferError::Internal(msg.into())
    }

    /// Create an unknown codec error from the three selector strings
    pub fn unknown_codec(
        layer: impl Into<String>,
        encoder: impl Into<String>,
        postencoder: impl Into<String>,
    ) -> Self {
        SplitInferError::UnknownCodec {
            layer: layer.into(),
            encoder: encoder.into(),
            postencoder: postencoder.into(),
        }
    }
}

/// Result type alias for SplitInfer operations
pub type Result<T> = std::result::Result<T, SplitInferError>;
