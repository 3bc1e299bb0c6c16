//! Stream framing for the inference protocol
//!
//! Every inbound item starts with an ASCII tag line:
//!
//! - `frame\n` followed by a big-endian `u32` frame number, a big-endian `u32`
//!   payload length and the payload bytes.
//! - `json\n` (or `ping\n`) followed by one JSON line. `{"ping": id}` is a
//!   liveness probe; anything else must be a [`ProcessorConfig`].
//!
//! Responses travel the other way as newline-terminated JSON.

use crate::config::ProcessorConfig;
use crate::message::{InboundItem, Response};
use bytes::Bytes;
use splitinfer_common::{Result, SplitInferError};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const TAG_FRAME: &str = "frame";
const TAG_JSON: &str = "json";
const TAG_PING: &str = "ping";

/// Size limits applied while reading
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_frame_bytes: usize,
    pub max_line_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024 * 1024,
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Reads [`InboundItem`]s off a buffered byte stream
pub struct FrameReader<R> {
    inner: R,
    limits: FrameLimits,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R, limits: FrameLimits) -> Self {
        Self { inner, limits }
    }

    /// Read the next item.
    ///
    /// Returns `Ok(None)` on a clean end of stream between items.
    pub async fn read_item(&mut self) -> Result<Option<InboundItem>> {
        loop {
            let tag = match self.read_line().await? {
                Some(tag) => tag,
                None => return Ok(None),
            };

            match tag.trim() {
                "" => continue,
                TAG_FRAME => return self.read_frame().await.map(Some),
                TAG_JSON | TAG_PING => {
                    let line = self.read_line().await?.ok_or_else(|| {
                        SplitInferError::protocol("stream ended before control message body")
                    })?;
                    return parse_control(&line).map(Some);
                }
                other => {
                    return Err(SplitInferError::protocol(format!(
                        "unknown item tag {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn read_frame(&mut self) -> Result<InboundItem> {
        let frame_number = self.inner.read_u32().await.map_err(truncated)?;
        let len = self.inner.read_u32().await.map_err(truncated)? as usize;

        if len > self.limits.max_frame_bytes {
            return Err(SplitInferError::protocol(format!(
                "frame {} payload of {} bytes exceeds limit of {}",
                frame_number, len, self.limits.max_frame_bytes
            )));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(truncated)?;
        trace!("Read frame {} ({} bytes)", frame_number, len);

        Ok(InboundItem::Frame {
            frame_number,
            payload: Bytes::from(payload),
        })
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let limit = self.limits.max_line_bytes as u64 + 1;
        let mut line = String::new();
        let n = (&mut self.inner).take(limit).read_line(&mut line).await?;

        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            if n as u64 >= limit {
                return Err(SplitInferError::protocol(format!(
                    "control line exceeds {} bytes",
                    self.limits.max_line_bytes
                )));
            }
            return Err(SplitInferError::protocol("stream ended inside a control line"));
        }

        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

fn truncated(err: std::io::Error) -> SplitInferError {
    if err.kind() == ErrorKind::UnexpectedEof {
        SplitInferError::protocol("stream ended inside a data frame")
    } else {
        SplitInferError::Io(err)
    }
}

/// Parse the body of a `json`/`ping` item
pub fn parse_control(line: &str) -> Result<InboundItem> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| SplitInferError::protocol(format!("malformed control JSON: {}", e)))?;

    if let Some(id) = value.get("ping") {
        let id = id
            .as_u64()
            .ok_or_else(|| SplitInferError::protocol("ping id must be an unsigned integer"))?;
        return Ok(InboundItem::Ping(id));
    }

    let config: ProcessorConfig = serde_json::from_value(value)
        .map_err(|e| SplitInferError::protocol(format!("unrecognized control message: {}", e)))?;
    Ok(InboundItem::Config(config))
}

/// Write a data frame (client side)
pub async fn write_frame<W>(writer: &mut W, frame_number: u32, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| SplitInferError::invalid_input("frame payload larger than 4 GiB"))?;

    writer.write_all(TAG_FRAME.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_u32(frame_number).await?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a processor configuration (client side)
pub async fn write_processor_config<W>(writer: &mut W, config: &ProcessorConfig) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_string(config)?;
    write_control(writer, TAG_JSON, &body).await
}

/// Write a ping (client side)
pub async fn write_ping<W>(writer: &mut W, id: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::json!({ "ping": id }).to_string();
    write_control(writer, TAG_JSON, &body).await
}

async fn write_control<W>(writer: &mut W, tag: &str, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("{}\n{}\n", tag, body).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one response line (client side). `Ok(None)` on end of stream.
pub async fn read_response<R>(reader: &mut R) -> Result<Option<Response>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Response::from_line(&line).map(Some)
}
