//! SplitInfer wire protocol
//!
//! Control and data messages exchanged between split-inference clients and
//! the server, plus the framing used to carry them over a byte stream.

pub mod config;
pub mod framing;
pub mod message;

pub use config::{
    EncoderKind, ModelConfig, PostencoderConfig, PostencoderKind, ProcessorConfig, SplitLayer,
};
pub use framing::{
    read_response, write_frame, write_ping, write_processor_config, FrameLimits, FrameReader,
};
pub use message::{InboundItem, Prediction, Response};
