//! Monitor listener
//!
//! Observers connect and receive recent [`MonitorEntry`] history followed by
//! live entries, one JSON object per line. An observer that opens with the
//! line `metrics` gets the Prometheus text dump instead.

use splitinfer_common::{Result, METRICS};
use splitinfer_worker::{MonitorEntry, MonitorStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// How long a new observer has to ask for metrics before streaming starts
const REQUEST_GRACE: Duration = Duration::from_millis(200);

/// Accept observers forever
pub async fn serve_monitor(
    listener: TcpListener,
    stats: Arc<MonitorStats>,
    expose_metrics: bool,
) -> Result<()> {
    info!("Monitor listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Monitor accept failed: {}", e);
                continue;
            }
        };

        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_observer(stream, peer, stats, expose_metrics).await {
                debug!("Observer {} disconnected: {}", peer, e);
            }
        });
    }
}

async fn handle_observer(
    stream: TcpStream,
    peer: SocketAddr,
    stats: Arc<MonitorStats>,
    expose_metrics: bool,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let asked = tokio::time::timeout(REQUEST_GRACE, reader.read_line(&mut line)).await;
    if matches!(asked, Ok(Ok(n)) if n > 0) && line.trim() == "metrics" {
        let body = if expose_metrics {
            METRICS.gather()
        } else {
            "# metrics disabled\n".to_string()
        };
        write_half.write_all(body.as_bytes()).await?;
        write_half.shutdown().await?;
        return Ok(());
    }

    info!("Observer {} subscribed", peer);
    stream_entries(&mut write_half, &stats).await
}

/// Write history then live entries until the writer fails
pub async fn stream_entries<W>(writer: &mut W, stats: &MonitorStats) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (history, mut rx) = stats.subscribe();
    for entry in &history {
        write_entry(writer, entry).await?;
    }

    loop {
        match rx.recv().await {
            Ok(entry) => write_entry(writer, &entry).await?,
            Err(RecvError::Lagged(skipped)) => debug!("Observer lagged, skipped {} entries", skipped),
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_entry<W>(writer: &mut W, entry: &MonitorEntry) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
