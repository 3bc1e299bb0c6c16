//! Many connections, one worker
//!
//! Every connection registers once and gets a [`WorkSender`] tagged with a
//! fresh id plus a [`WorkReceiver`] for its replies. All senders feed one
//! FIFO queue drained by the processor thread with [`WorkDistributor::get`];
//! replies are routed back by id with [`WorkDistributor::put`].

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use splitinfer_common::{Result, SplitInferError, METRICS};
use splitinfer_proto::{ModelConfig, PostencoderConfig, ProcessorConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Process-unique connection identifier
pub type ConnectionId = u64;

/// Work a connection asks the processor to do
#[derive(Debug)]
pub enum Request {
    /// Handshake: move the session to this configuration, then report ready
    Configure(ProcessorConfig),
    Acquire(ModelConfig),
    Release(ModelConfig),
    InitPostencoder(PostencoderConfig),
    Predict { frame_number: u32, payload: Bytes },
    Ready,
    Ping(u64),
    /// Orderly end of the connection
    Terminate,
    /// The reader hit a fatal error; report it, then terminate
    Abort(SplitInferError),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Configure(_) => "configure",
            Request::Acquire(_) => "acquire",
            Request::Release(_) => "release",
            Request::InitPostencoder(_) => "init_postencoder",
            Request::Predict { .. } => "predict",
            Request::Ready => "ready",
            Request::Ping(_) => "ping",
            Request::Terminate => "terminate",
            Request::Abort(_) => "abort",
        }
    }
}

/// Item delivered to a connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Bytes to write as-is
    Message(Bytes),
    /// Close the connection after everything before it is written
    Close,
}

/// A request tagged with its originating connection
#[derive(Debug)]
pub struct WorkItem {
    pub connection_id: ConnectionId,
    pub request: Request,
}

enum Envelope {
    Work(WorkItem),
    Shutdown,
}

struct Shared {
    inbound_tx: Sender<Envelope>,
    inbound_rx: Receiver<Envelope>,
    routes: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Shared handle; clones refer to the same queue and routing table
#[derive(Clone)]
pub struct WorkDistributor {
    shared: Arc<Shared>,
}

impl WorkDistributor {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                inbound_tx,
                inbound_rx,
                routes: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Allocate a connection id and its channel pair
    pub fn register(&self) -> (WorkSender, WorkReceiver) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.routes.write().insert(id, tx);
        debug!("Registered connection {}", id);

        (
            WorkSender {
                id,
                tx: self.shared.inbound_tx.clone(),
            },
            WorkReceiver {
                id,
                rx,
                shared: self.shared.clone(),
            },
        )
    }

    /// Route an item to a connection. Returns `false` if it is gone.
    pub fn put(&self, id: ConnectionId, item: Outbound) -> bool {
        let routes = self.shared.routes.read();
        match routes.get(&id) {
            Some(tx) => tx.send(item).is_ok(),
            None => {
                trace!("Dropping outbound item for departed connection {}", id);
                false
            }
        }
    }

    /// Block until work arrives. `None` once shut down.
    pub fn get(&self) -> Option<WorkItem> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        match self.shared.inbound_rx.recv() {
            Ok(envelope) => self.open(envelope),
            Err(_) => None,
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> Option<WorkItem> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        match self.shared.inbound_rx.recv_timeout(timeout) {
            Ok(envelope) => self.open(envelope),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn open(&self, envelope: Envelope) -> Option<WorkItem> {
        match envelope {
            Envelope::Work(item) => {
                METRICS.processor.queue_depth.dec();
                Some(item)
            }
            Envelope::Shutdown => {
                self.shared.closed.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Wake the worker and make every later `get` return `None`
    pub fn shutdown(&self) {
        let _ = self.shared.inbound_tx.send(Envelope::Shutdown);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of connections with a live receiver
    pub fn connection_count(&self) -> usize {
        self.shared.routes.read().len()
    }

    /// Requests waiting for the worker
    pub fn queue_len(&self) -> usize {
        self.shared.inbound_rx.len()
    }
}

impl Default for WorkDistributor {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer half bound to one connection id
#[derive(Clone)]
pub struct WorkSender {
    id: ConnectionId,
    tx: Sender<Envelope>,
}

impl WorkSender {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(Envelope::Work(WorkItem {
                connection_id: self.id,
                request,
            }))
            .map_err(|_| SplitInferError::internal("work queue closed"))?;
        METRICS.processor.queue_depth.inc();
        Ok(())
    }
}

/// Consumer half for one connection's replies; unregisters on drop
pub struct WorkReceiver {
    id: ConnectionId,
    rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
}

impl WorkReceiver {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next item, or `None` when the distributor is gone
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }
}

impl Drop for WorkReceiver {
    fn drop(&mut self) {
        self.shared.routes.write().remove(&self.id);
        debug!("Unregistered connection {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn message(text: &'static str) -> Outbound {
        Outbound::Message(Bytes::from_static(text.as_bytes()))
    }

    #[test]
    fn test_concurrent_registration_unique_ids() {
        let distributor = WorkDistributor::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let distributor = distributor.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| {
                            let (sender, receiver) = distributor.register();
                            assert_eq!(sender.id(), receiver.id());
                            // keep the route alive for the count below
                            std::mem::forget(receiver);
                            sender.id()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<ConnectionId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 400);
        assert_eq!(distributor.connection_count(), 400);
    }

    #[tokio::test]
    async fn test_put_routes_by_id() {
        let distributor = WorkDistributor::new();
        let (a, mut a_rx) = distributor.register();
        let (b, mut b_rx) = distributor.register();

        assert!(distributor.put(a.id(), message("a1")));
        assert!(distributor.put(b.id(), message("b1")));
        assert!(distributor.put(a.id(), message("a2")));
        assert!(distributor.put(a.id(), Outbound::Close));

        assert_eq!(a_rx.recv().await, Some(message("a1")));
        assert_eq!(a_rx.recv().await, Some(message("a2")));
        assert_eq!(a_rx.recv().await, Some(Outbound::Close));
        assert_eq!(b_rx.recv().await, Some(message("b1")));
    }

    #[test]
    fn test_put_to_departed_connection_is_dropped() {
        let distributor = WorkDistributor::new();
        let (sender, receiver) = distributor.register();
        drop(receiver);

        assert!(!distributor.put(sender.id(), message("late")));
        assert!(!distributor.put(9999, message("never")));
        assert_eq!(distributor.connection_count(), 0);
    }

    #[test]
    fn test_get_preserves_global_arrival_order() {
        let distributor = WorkDistributor::new();
        let (a, _a_rx) = distributor.register();
        let (b, _b_rx) = distributor.register();

        a.send(Request::Ping(1)).unwrap();
        b.send(Request::Ping(2)).unwrap();
        a.send(Request::Ready).unwrap();
        b.send(Request::Terminate).unwrap();
        assert_eq!(distributor.queue_len(), 4);

        let order: Vec<(ConnectionId, &'static str)> = (0..4)
            .map(|_| {
                let item = distributor.get().unwrap();
                (item.connection_id, item.request.name())
            })
            .collect();

        assert_eq!(
            order,
            vec![
                (a.id(), "ping"),
                (b.id(), "ping"),
                (a.id(), "ready"),
                (b.id(), "terminate"),
            ]
        );
    }

    #[test]
    fn test_shutdown_wakes_blocked_worker() {
        let distributor = WorkDistributor::new();
        let worker = {
            let distributor = distributor.clone();
            std::thread::spawn(move || distributor.get().is_none())
        };

        distributor.shutdown();
        assert!(worker.join().unwrap());
        assert!(distributor.is_shut_down());
        assert!(distributor.get_timeout(Duration::from_millis(10)).is_none());
    }
}
