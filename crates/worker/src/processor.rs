//! The single inference worker
//!
//! One `Processor` drains the [`WorkDistributor`] on its own OS thread. It
//! alone owns the [`ModelManager`] and the per-connection sessions, so none
//! of that state is locked.
//!
//! Per connection the session moves `Idle -> Acquired -> Idle -> ...` and
//! ends on `Terminate`. A failing request is reported to its connection and
//! the loop carries on; only connection-fatal errors end that connection.

use crate::codec::{select_predecoder, DecodePipeline};
use crate::distributor::{ConnectionId, Outbound, Request, WorkDistributor, WorkItem};
use crate::model::{ModelLoader, ModelManager};
use crate::monitor::{MonitorEntry, MonitorStats};
use bytes::Bytes;
use splitinfer_common::metrics::LatencyTimer;
use splitinfer_common::{ModelStateError, QuantizationParams, Result, SplitInferError, METRICS};
use splitinfer_proto::{ModelConfig, PostencoderConfig, PostencoderKind, ProcessorConfig, Response};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// State of one connection, owned by the processor
#[derive(Debug, Default)]
struct Session {
    model_config: Option<ModelConfig>,
    postencoder: PostencoderConfig,
    /// Built on first use, dropped whenever the inputs to selection change
    predecoder: Option<DecodePipeline>,
}

impl Session {
    fn invalidate(&mut self) {
        self.predecoder = None;
    }
}

pub struct Processor {
    distributor: WorkDistributor,
    models: ModelManager,
    sessions: HashMap<ConnectionId, Session>,
    monitor: Arc<MonitorStats>,
    /// Used when a model does not declare its own quantization
    quantization: QuantizationParams,
}

impl Processor {
    pub fn new(
        distributor: WorkDistributor,
        loader: Box<dyn ModelLoader>,
        monitor: Arc<MonitorStats>,
        quantization: QuantizationParams,
    ) -> Self {
        Self {
            distributor,
            models: ModelManager::new(loader),
            sessions: HashMap::new(),
            monitor,
            quantization,
        }
    }

    /// Run on a dedicated thread named `processor`
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("processor".to_string())
            .spawn(move || self.run())
    }

    /// Serve until the distributor shuts down
    pub fn run(mut self) {
        info!("Processor started");

        while let Some(item) = self.distributor.get() {
            self.dispatch(item);
        }

        let open: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        for id in open {
            self.terminate(id);
        }
        info!("Processor stopped");
    }

    fn dispatch(&mut self, item: WorkItem) {
        METRICS.processor.requests_total.inc();

        let id = item.connection_id;
        let name = item.request.name();
        let frame_number = match &item.request {
            Request::Predict { frame_number, .. } => Some(*frame_number),
            _ => None,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handle(id, item.request)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!("Request {} from connection {} failed", name, id);
                self.fail(id, frame_number, err);
            }
            Err(_) => {
                error!("Request {} from connection {} panicked", name, id);
                self.report(id, frame_number, &SplitInferError::internal("request handler panicked"));
                self.terminate(id);
            }
        }
    }

    fn handle(&mut self, id: ConnectionId, request: Request) -> Result<()> {
        match request {
            Request::Configure(config) => {
                if let Err(err) = self.configure(id, config) {
                    if err.is_connection_fatal() {
                        return Err(err);
                    }
                    self.fail(id, None, err);
                }
                self.ready(id)
            }
            Request::Acquire(config) => self.acquire(id, config),
            Request::Release(config) => self.release(id, &config),
            Request::InitPostencoder(config) => self.init_postencoder(id, config),
            Request::Predict {
                frame_number,
                payload,
            } => self.predict(id, frame_number, payload),
            Request::Ready => self.ready(id),
            Request::Ping(ping) => self.respond(id, &Response::Ping { id: ping }),
            Request::Terminate => {
                self.terminate(id);
                Ok(())
            }
            Request::Abort(err) => {
                self.report(id, None, &err);
                self.terminate(id);
                Ok(())
            }
        }
    }

    /// Release and acquire only when the model changes, then apply the postencoder
    fn configure(&mut self, id: ConnectionId, config: ProcessorConfig) -> Result<()> {
        let held = self.sessions.get(&id).and_then(|s| s.model_config.clone());
        if held.as_ref() != Some(&config.model_config) {
            if let Some(previous) = held {
                self.release(id, &previous)?;
            }
            self.acquire(id, config.model_config)?;
        }
        self.init_postencoder(id, config.postencoder_config)
    }

    fn ready(&self, id: ConnectionId) -> Result<()> {
        let model_config = self.sessions.get(&id).and_then(|s| s.model_config.clone());
        self.respond(id, &Response::Ready { model_config })
    }

    fn acquire(&mut self, id: ConnectionId, config: ModelConfig) -> Result<()> {
        let session = self.sessions.entry(id).or_default();
        if session.model_config.is_some() {
            return Err(ModelStateError::AlreadyAcquired.into());
        }

        self.models.acquire(&config)?;
        info!(
            "Connection {} acquired {} (refcount {})",
            id,
            config,
            self.models.refcount(&config)
        );

        session.model_config = Some(config);
        session.invalidate();
        Ok(())
    }

    fn release(&mut self, id: ConnectionId, config: &ModelConfig) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ModelStateError::NotAcquired)?;

        match &session.model_config {
            None => return Err(ModelStateError::NotAcquired.into()),
            Some(held) if held != config => return Err(ModelStateError::ConfigMismatch.into()),
            Some(_) => {}
        }

        self.models.release(config)?;
        info!(
            "Connection {} released {} (refcount {})",
            id,
            config,
            self.models.refcount(config)
        );

        session.model_config = None;
        session.invalidate();
        Ok(())
    }

    fn init_postencoder(&mut self, id: ConnectionId, postencoder: PostencoderConfig) -> Result<()> {
        let config = self.held_config(id)?;
        // Select now so an unusable combination fails before any frame arrives
        let pipeline = self.select(&config, postencoder.kind)?;

        if let Some(session) = self.sessions.get_mut(&id) {
            session.postencoder = postencoder;
            session.predecoder = Some(pipeline);
        }
        Ok(())
    }

    fn predict(&mut self, id: ConnectionId, frame_number: u32, payload: Bytes) -> Result<()> {
        let config = self.held_config(id)?;

        self.respond(
            id,
            &Response::Confirmation {
                frame_number,
                num_bytes: payload.len(),
            },
        )?;

        let pipeline = self.pipeline(id, &config)?;
        let start = Instant::now();

        let tensor = METRICS
            .processor
            .decode_duration
            .time(|| pipeline.run(&payload))?;
        let predictions = METRICS.processor.inference_duration.time(|| {
            let output = self.models.predict(&config, &tensor)?;
            self.models.decode_predictions(&config, &output)
        })?;

        let inference_time_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Connection {} frame {}: {} bytes via {} in {} ms",
            id,
            frame_number,
            payload.len(),
            pipeline.predecoder.name(),
            inference_time_ms
        );

        // Observers see the entry no later than the client sees the result
        self.monitor.publish(MonitorEntry {
            frame_number,
            connection_id: id,
            inference_time_ms,
            predictions: predictions.clone(),
            preview: tensor.summary(),
        });
        METRICS.processor.predictions_total.inc();

        self.respond(
            id,
            &Response::Result {
                frame_number,
                inference_time_ms,
                predictions,
            },
        )
    }

    /// The cached predecoder for this session, built if missing
    fn pipeline(&mut self, id: ConnectionId, config: &ModelConfig) -> Result<DecodePipeline> {
        let (cached, kind) = match self.sessions.get(&id) {
            Some(session) => (session.predecoder.clone(), session.postencoder.kind),
            None => (None, PostencoderKind::None),
        };
        if let Some(pipeline) = cached {
            return Ok(pipeline);
        }

        let pipeline = self.select(config, kind)?;
        if let Some(session) = self.sessions.get_mut(&id) {
            session.predecoder = Some(pipeline.clone());
        }
        Ok(pipeline)
    }

    fn select(&self, config: &ModelConfig, kind: PostencoderKind) -> Result<DecodePipeline> {
        let layout = self.models.input_tensor_layout(config)?;
        let quantization = self.models.quantization(config)?.unwrap_or(self.quantization);
        let pipeline = select_predecoder(config, kind, &layout, quantization)?;

        debug!(
            "Selected {} predecoder for {} with postencoder {}{}",
            pipeline.predecoder.name(),
            config,
            kind,
            if pipeline.dequantize.is_some() { " (dequantize)" } else { "" }
        );
        Ok(pipeline)
    }

    fn held_config(&self, id: ConnectionId) -> Result<ModelConfig> {
        self.sessions
            .get(&id)
            .and_then(|s| s.model_config.clone())
            .ok_or_else(|| ModelStateError::NotAcquired.into())
    }

    /// Drop the session, releasing its model, and close the connection
    fn terminate(&mut self, id: ConnectionId) {
        if let Some(session) = self.sessions.remove(&id) {
            if let Some(config) = session.model_config {
                match self.models.release(&config) {
                    Ok(()) => info!("Connection {} implicitly released {}", id, config),
                    Err(e) => warn!("Connection {} could not release {}: {}", id, config, e),
                }
            }
        }
        self.distributor.put(id, Outbound::Close);
        debug!("Connection {} terminated", id);
    }

    fn fail(&mut self, id: ConnectionId, frame_number: Option<u32>, err: SplitInferError) {
        self.report(id, frame_number, &err);
        if err.is_connection_fatal() {
            self.terminate(id);
        }
    }

    fn report(&self, id: ConnectionId, frame_number: Option<u32>, err: &SplitInferError) {
        METRICS.processor.requests_failed.inc();
        if err.is_connection_fatal() {
            error!("Connection {}: {}", id, err);
        } else {
            warn!("Connection {}: {}", id, err);
        }

        let response = Response::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            frame_number,
        };
        if let Err(e) = self.respond(id, &response) {
            error!("Cannot report error to connection {}: {}", id, e);
        }
    }

    fn respond(&self, id: ConnectionId, response: &Response) -> Result<()> {
        let line = response.to_line()?;
        self.distributor.put(id, Outbound::Message(line));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::{WorkReceiver, WorkSender};
    use crate::layout::{AxisOrder, TensorLayout};
    use crate::model::{ClassifierHead, Label, LoadedModel};
    use crate::tensor::DType;
    use splitinfer_proto::{EncoderKind, SplitLayer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubLoader {
        loads: Arc<AtomicUsize>,
    }

    impl ModelLoader for StubLoader {
        fn load(&self, config: &ModelConfig) -> Result<LoadedModel> {
            if config.model != "resnet34" {
                return Err(SplitInferError::model(format!("unknown model {}", config.model)));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);

            let layout = TensorLayout::new(3, 2, 2, DType::F32, AxisOrder::Hwc)?;
            let labels = ["red", "green", "blue"]
                .iter()
                .map(|n| Label {
                    name: n.to_string(),
                    description: format!("mostly {}", n),
                })
                .collect();
            Ok(LoadedModel {
                input_layout: layout,
                quantization: None,
                model: Box::new(ClassifierHead::passthrough(layout, true, labels, 3)?),
            })
        }
    }

    struct Harness {
        distributor: WorkDistributor,
        monitor: Arc<MonitorStats>,
        loads: Arc<AtomicUsize>,
        worker: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start() -> Self {
            let distributor = WorkDistributor::new();
            let monitor = Arc::new(MonitorStats::new(16));
            let loads = Arc::new(AtomicUsize::new(0));
            let processor = Processor::new(
                distributor.clone(),
                Box::new(StubLoader {
                    loads: loads.clone(),
                }),
                monitor.clone(),
                QuantizationParams::default(),
            );
            Self {
                distributor,
                monitor,
                loads,
                worker: Some(processor.spawn().unwrap()),
            }
        }

        fn connect(&self) -> (WorkSender, WorkReceiver) {
            self.distributor.register()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.distributor.shutdown();
            if let Some(worker) = self.worker.take() {
                worker.join().unwrap();
            }
        }
    }

    async fn next(rx: &mut WorkReceiver) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for processor")
            .expect("distributor gone")
    }

    async fn next_response(rx: &mut WorkReceiver) -> Response {
        match next(rx).await {
            Outbound::Message(line) => Response::from_line(std::str::from_utf8(&line).unwrap()).unwrap(),
            Outbound::Close => panic!("connection closed unexpectedly"),
        }
    }

    fn server_config() -> ModelConfig {
        ModelConfig::new("resnet34", SplitLayer::Server, EncoderKind::None)
    }

    fn error_kind(response: Response) -> String {
        match response {
            Response::Error { kind, .. } => kind,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_predict_confirms_then_answers() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();

        tx.send(Request::Acquire(server_config())).unwrap();
        tx.send(Request::Ready).unwrap();
        assert_eq!(
            next_response(&mut rx).await,
            Response::Ready {
                model_config: Some(server_config())
            }
        );

        // 2x2 RGB frame, green dominates
        let frame: Vec<u8> = [10u8, 200, 30].repeat(4);
        tx.send(Request::Predict {
            frame_number: 1,
            payload: Bytes::from(frame),
        })
        .unwrap();

        assert_eq!(
            next_response(&mut rx).await,
            Response::Confirmation {
                frame_number: 1,
                num_bytes: 12
            }
        );
        match next_response(&mut rx).await {
            Response::Result {
                frame_number,
                predictions,
                ..
            } => {
                assert_eq!(frame_number, 1);
                assert_eq!(predictions.len(), 3);
                assert_eq!(predictions[0].name, "green");
            }
            other => panic!("expected result, got {:?}", other),
        }

        assert_eq!(harness.monitor.history_len(), 1);
    }

    #[tokio::test]
    async fn test_model_state_errors_are_recoverable() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();

        tx.send(Request::Predict {
            frame_number: 9,
            payload: Bytes::from_static(&[0; 12]),
        })
        .unwrap();
        match next_response(&mut rx).await {
            Response::Error {
                kind, frame_number, ..
            } => {
                assert_eq!(kind, "not_acquired");
                assert_eq!(frame_number, Some(9));
            }
            other => panic!("expected error, got {:?}", other),
        }

        tx.send(Request::Release(server_config())).unwrap();
        assert_eq!(error_kind(next_response(&mut rx).await), "not_acquired");

        tx.send(Request::Acquire(server_config())).unwrap();
        tx.send(Request::Acquire(server_config())).unwrap();
        assert_eq!(error_kind(next_response(&mut rx).await), "already_acquired");

        let other = ModelConfig::new("resnet34", SplitLayer::Client, EncoderKind::None);
        tx.send(Request::Release(other)).unwrap();
        assert_eq!(error_kind(next_response(&mut rx).await), "config_mismatch");

        tx.send(Request::Ping(77)).unwrap();
        assert_eq!(next_response(&mut rx).await, Response::Ping { id: 77 });
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_stop_worker() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();

        tx.send(Request::Acquire(server_config())).unwrap();
        tx.send(Request::Predict {
            frame_number: 1,
            payload: Bytes::from_static(&[1, 2, 3]),
        })
        .unwrap();

        assert!(matches!(
            next_response(&mut rx).await,
            Response::Confirmation { frame_number: 1, .. }
        ));
        assert_eq!(error_kind(next_response(&mut rx).await), "codec");

        tx.send(Request::Ping(1)).unwrap();
        assert_eq!(next_response(&mut rx).await, Response::Ping { id: 1 });
    }

    #[tokio::test]
    async fn test_unknown_codec_closes_connection() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();
        let (other_tx, mut other_rx) = harness.connect();

        tx.send(Request::Acquire(server_config())).unwrap();
        tx.send(Request::InitPostencoder(PostencoderConfig::new(PostencoderKind::Jpeg2000)))
            .unwrap();

        assert_eq!(error_kind(next_response(&mut rx).await), "unknown_codec");
        assert_eq!(next(&mut rx).await, Outbound::Close);

        other_tx.send(Request::Ping(5)).unwrap();
        assert_eq!(next_response(&mut other_rx).await, Response::Ping { id: 5 });
    }

    #[tokio::test]
    async fn test_terminate_releases_model() {
        let harness = Harness::start();
        let (a, mut a_rx) = harness.connect();
        let (b, mut b_rx) = harness.connect();

        a.send(Request::Acquire(server_config())).unwrap();
        b.send(Request::Acquire(server_config())).unwrap();
        a.send(Request::Terminate).unwrap();
        assert_eq!(next(&mut a_rx).await, Outbound::Close);

        b.send(Request::Terminate).unwrap();
        assert_eq!(next(&mut b_rx).await, Outbound::Close);
        assert_eq!(harness.loads.load(Ordering::SeqCst), 1);

        // Evicted with its last user, so the next acquire loads again
        let (c, mut c_rx) = harness.connect();
        c.send(Request::Acquire(server_config())).unwrap();
        c.send(Request::Ready).unwrap();
        assert!(matches!(next_response(&mut c_rx).await, Response::Ready { .. }));
        assert_eq!(harness.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_reports_and_closes() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();

        tx.send(Request::Abort(SplitInferError::protocol("garbage on the wire")))
            .unwrap();
        assert_eq!(error_kind(next_response(&mut rx).await), "protocol");
        assert_eq!(next(&mut rx).await, Outbound::Close);
    }

    fn handshake(model_config: ModelConfig) -> Request {
        Request::Configure(ProcessorConfig {
            model_config,
            postencoder_config: PostencoderConfig::new(PostencoderKind::None),
        })
    }

    #[tokio::test]
    async fn test_configure_retries_failed_acquire() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();
        let missing = ModelConfig::new("vgg", SplitLayer::Server, EncoderKind::None);

        for _ in 0..2 {
            tx.send(handshake(missing.clone())).unwrap();
            assert_eq!(error_kind(next_response(&mut rx).await), "model");
            assert_eq!(
                next_response(&mut rx).await,
                Response::Ready { model_config: None }
            );
        }

        // Nothing was held, so switching must not try to release
        tx.send(handshake(server_config())).unwrap();
        assert_eq!(
            next_response(&mut rx).await,
            Response::Ready {
                model_config: Some(server_config())
            }
        );
        assert_eq!(harness.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configure_switches_models() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();
        let client = ModelConfig::new("resnet34", SplitLayer::Client, EncoderKind::None);

        tx.send(handshake(server_config())).unwrap();
        tx.send(handshake(server_config())).unwrap();
        tx.send(handshake(client.clone())).unwrap();

        for expected in [server_config(), server_config(), client.clone()] {
            assert_eq!(
                next_response(&mut rx).await,
                Response::Ready {
                    model_config: Some(expected)
                }
            );
        }
        // Same config twice loads once; the switch loads the client model
        assert_eq!(harness.loads.load(Ordering::SeqCst), 2);

        tx.send(Request::Release(server_config())).unwrap();
        assert_eq!(error_kind(next_response(&mut rx).await), "config_mismatch");
    }

    #[tokio::test]
    async fn test_configure_unknown_codec_skips_ready() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();

        tx.send(Request::Configure(ProcessorConfig {
            model_config: server_config(),
            postencoder_config: PostencoderConfig::new(PostencoderKind::Png),
        }))
        .unwrap();

        assert_eq!(error_kind(next_response(&mut rx).await), "unknown_codec");
        assert_eq!(next(&mut rx).await, Outbound::Close);
    }

    #[tokio::test]
    async fn test_missing_model_fails_acquire_only() {
        let harness = Harness::start();
        let (tx, mut rx) = harness.connect();

        tx.send(Request::Acquire(ModelConfig::new("vgg", SplitLayer::Server, EncoderKind::None)))
            .unwrap();
        assert_eq!(error_kind(next_response(&mut rx).await), "model");

        tx.send(Request::Acquire(server_config())).unwrap();
        tx.send(Request::Ready).unwrap();
        assert_eq!(
            next_response(&mut rx).await,
            Response::Ready {
                model_config: Some(server_config())
            }
        );
    }
}
