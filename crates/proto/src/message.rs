//! Inbound items and outbound responses

use crate::config::{ModelConfig, ProcessorConfig};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use splitinfer_common::Result;

/// One decoded prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub name: String,
    pub description: String,
    pub score: f32,
}

/// An item parsed off a client connection
#[derive(Debug, Clone, PartialEq)]
pub enum InboundItem {
    /// Data frame carrying a (possibly compressed) tensor
    Frame { frame_number: u32, payload: Bytes },

    /// Model + postencoder (re)configuration
    Config(ProcessorConfig),

    /// Liveness probe
    Ping(u64),
}

/// Newline-terminated JSON written back to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Sent as soon as a frame is dequeued, before decoding starts
    Confirmation { frame_number: u32, num_bytes: usize },

    /// Outcome of decode + inference for a frame
    Result {
        frame_number: u32,
        inference_time_ms: u64,
        predictions: Vec<Prediction>,
    },

    /// Handshake echo of the acquired configuration
    Ready { model_config: Option<ModelConfig> },

    /// Ping echo
    Ping { id: u64 },

    /// Failure scoped to this connection
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_number: Option<u32>,
    },
}

impl Response {
    /// Serialize as a single `\n`-terminated line
    pub fn to_line(&self) -> Result<Bytes> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    /// Parse a line previously produced by [`Response::to_line`]
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}
