//! Per-connection reader and writer tasks
//!
//! The reader turns wire items into [`Request`]s; the writer drains the
//! connection's outbound channel. The processor closes a connection by
//! sending [`Outbound::Close`], which ends the writer and then the reader.

use bytes::Bytes;
use splitinfer_common::{Result, METRICS};
use splitinfer_proto::{FrameLimits, FrameReader, InboundItem};
use splitinfer_worker::{Outbound, Request, WorkDistributor, WorkReceiver, WorkSender};
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Serve one client until either side closes
pub async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    distributor: WorkDistributor,
    limits: FrameLimits,
) {
    METRICS.connections.accepted_total.inc();
    METRICS.connections.active.inc();

    let (sender, receiver) = distributor.register();
    let id = sender.id();
    info!("Connection {} accepted from {}", id, peer);

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Connection {}: cannot set TCP_NODELAY: {}", id, e);
    }
    let (read_half, write_half) = stream.into_split();

    let reader = tokio::spawn(read_loop(
        FrameReader::new(BufReader::new(read_half), limits),
        sender.clone(),
    ));

    if let Err(e) = write_loop(write_half, receiver).await {
        debug!("Connection {}: write side failed: {}", id, e);
    }

    // Writer is gone; make sure the processor forgets this connection
    if !reader.is_finished() {
        reader.abort();
        let _ = sender.send(Request::Terminate);
    }

    METRICS.connections.active.dec();
    info!("Connection {} from {} closed", id, peer);
}

/// Parse items until end of stream or a fatal error.
///
/// A control message becomes one `configure` request; the processor decides
/// what to release and acquire against the session it holds.
pub async fn read_loop<R>(mut reader: FrameReader<R>, sender: WorkSender) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match reader.read_item().await {
            Ok(Some(InboundItem::Frame {
                frame_number,
                payload,
            })) => {
                METRICS
                    .connections
                    .bytes_received_total
                    .inc_by(payload.len() as u64);
                sender.send(Request::Predict {
                    frame_number,
                    payload,
                })?;
            }
            Ok(Some(InboundItem::Config(config))) => sender.send(Request::Configure(config))?,
            Ok(Some(InboundItem::Ping(id))) => sender.send(Request::Ping(id))?,
            Ok(None) => {
                debug!("Connection {} reached end of stream", sender.id());
                return sender.send(Request::Terminate);
            }
            Err(err) => {
                warn!("Connection {} read failed: {}", sender.id(), err);
                return sender.send(Request::Abort(err));
            }
        }
    }
}

/// Write outbound items until `Close` or the distributor goes away
pub async fn write_loop<W>(writer: W, mut receiver: WorkReceiver) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(item) = receiver.recv().await {
        match item {
            Outbound::Message(line) => write_line(&mut writer, &line).await?,
            Outbound::Close => break,
        }
    }

    writer.shutdown().await?;
    Ok(())
}

async fn write_line<W>(writer: &mut W, line: &Bytes) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line).await?;
    writer.flush().await?;
    Ok(())
}
