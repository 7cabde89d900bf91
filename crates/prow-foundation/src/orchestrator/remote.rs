//! Remote streaming client over a persistent engine channel.
//!
//! One [`EngineTransport`] channel is established at initialization and
//! reused across every request the provider ever serves. Each request gets
//! a process-unique [`CorrelationId`]; a single reader task demultiplexes
//! incoming frames onto per-request routes keyed by that id, so any number
//! of logical requests can be in flight over the one channel at a time.
//!
//! ## Sentinel policy
//!
//! The engine terminates every request's frame sequence with a sentinel
//! stop token. The reader never forwards the sentinel text: it yields one
//! empty increment in its place and closes the route, so the consumer sees
//! a clean end-of-stream exactly one increment after the sentinel arrived.
//!
//! ## Cancellation and backpressure
//!
//! Abandoning a stream drops only that route's receiver. The reader
//! notices on the next frame for that id, discards the route, and keeps
//! serving every other correlation id; the shared channel is never
//! poisoned by a partially consumed stream. Concurrency over the channel
//! is bounded by an in-flight semaphore, and each route buffers a bounded
//! number of undelivered increments.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::backend::{InferenceBackend, PreparedRequest};
use super::engine::{CorrelationId, EngineRequest, EngineTransport};
use super::types::{InferenceError, Result, Token, TokenStream};

/// Stop-token sentinel the engine closes every request stream with.
pub const STOP_TOKEN: &str = "<|im_end|>";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the remote streaming client.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Sentinel text the engine ends each request with.
    pub stop_token: String,
    /// Per-request route buffer, in increments.
    pub stream_buffer: usize,
    /// Upper bound on concurrent requests over the shared channel.
    pub max_in_flight: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            stop_token: STOP_TOKEN.to_string(),
            stream_buffer: 32,
            max_in_flight: 64,
        }
    }
}

impl RemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_token(mut self, stop_token: impl Into<String>) -> Self {
        self.stop_token = stop_token.into();
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }
}

// ============================================================================
// RemoteEngineProvider
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Closed,
    Open,
    Failed,
}

type RouteTable = HashMap<CorrelationId, mpsc::Sender<Result<Token>>>;

/// [`InferenceBackend`] over a persistent bidirectional engine stream.
pub struct RemoteEngineProvider {
    transport: Arc<dyn EngineTransport>,
    config: RemoteConfig,
    /// Process identity baked into every correlation id.
    pid: u32,
    /// Monotonic per-instance sequence, starts at 1, never reused.
    next_seq: AtomicU64,
    routes: Arc<Mutex<RouteTable>>,
    in_flight: Arc<Semaphore>,
    state: Arc<RwLock<ChannelState>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteEngineProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEngineProvider")
            .field("config", &self.config)
            .field("pid", &self.pid)
            .finish()
    }
}

impl RemoteEngineProvider {
    pub fn new(transport: Arc<dyn EngineTransport>, config: RemoteConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            transport,
            config,
            pid: std::process::id(),
            next_seq: AtomicU64::new(1),
            routes: Arc::new(Mutex::new(HashMap::new())),
            in_flight,
            state: Arc::new(RwLock::new(ChannelState::Closed)),
            reader: Mutex::new(None),
        }
    }

    fn next_correlation(&self) -> CorrelationId {
        CorrelationId::new(self.pid, self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    async fn ensure_open(&self) -> Result<()> {
        match *self.state.read().await {
            ChannelState::Open => Ok(()),
            ChannelState::Closed => Err(InferenceError::BackendUnavailable(
                "remote engine channel not established, call initialize() first".to_string(),
            )),
            ChannelState::Failed => Err(InferenceError::BackendUnavailable(
                "remote engine channel failed, reinitialize before submitting".to_string(),
            )),
        }
    }

    /// The single reader behind the shared channel. Forwards each frame to
    /// the route its correlation id names, applying the sentinel policy;
    /// exits when the channel closes or fails.
    async fn run_reader(
        transport: Arc<dyn EngineTransport>,
        routes: Arc<Mutex<RouteTable>>,
        state: Arc<RwLock<ChannelState>>,
        stop_token: String,
    ) {
        loop {
            match transport.recv().await {
                Ok(Some(frame)) => {
                    let sender = { routes.lock().await.get(&frame.correlation).cloned() };
                    let Some(sender) = sender else {
                        // Route already abandoned; discard the frame.
                        continue;
                    };

                    let is_stop = frame.text == stop_token;
                    let item = if is_stop {
                        Ok(Token::new(""))
                    } else {
                        Ok(Token::new(frame.text))
                    };

                    let delivered = sender.send(item).await.is_ok();
                    if is_stop || !delivered {
                        routes.lock().await.remove(&frame.correlation);
                    }
                }
                Ok(None) => {
                    tracing::info!("RemoteEngine: channel closed, ending reader");
                    routes.lock().await.clear();
                    *state.write().await = ChannelState::Closed;
                    break;
                }
                Err(e) => {
                    tracing::error!("RemoteEngine: channel failed: {}", e);
                    let message = e.to_string();
                    let mut routes = routes.lock().await;
                    for (_, sender) in routes.drain() {
                        let _ = sender.try_send(Err(InferenceError::Stream(message.clone())));
                    }
                    *state.write().await = ChannelState::Failed;
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl InferenceBackend for RemoteEngineProvider {
    fn name(&self) -> &str {
        "RemoteEngine"
    }

    /// Establish the persistent stream and start the reader. Idempotent:
    /// an already-open channel is left alone.
    async fn initialize(&self) -> Result<()> {
        self.transport.open().await?;

        let mut reader = self.reader.lock().await;
        if *self.state.read().await == ChannelState::Open && reader.is_some() {
            return Ok(());
        }

        if let Some(stale) = reader.take() {
            stale.abort();
        }

        *self.state.write().await = ChannelState::Open;
        *reader = Some(tokio::spawn(Self::run_reader(
            Arc::clone(&self.transport),
            Arc::clone(&self.routes),
            Arc::clone(&self.state),
            self.config.stop_token.clone(),
        )));

        tracing::info!(
            "RemoteEngine: persistent stream established (max {} in flight)",
            self.config.max_in_flight
        );
        Ok(())
    }

    async fn is_available(&self) -> bool {
        *self.state.read().await == ChannelState::Open
    }

    /// Non-streaming variant: drain the stream and concatenate. The
    /// sentinel already maps to an empty increment, so the join is clean.
    async fn generate(&self, request: &PreparedRequest) -> Result<String> {
        let mut stream = self.stream(request).await?;
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            text.push_str(&item?.text);
        }
        Ok(text)
    }

    async fn stream(&self, request: &PreparedRequest) -> Result<TokenStream> {
        self.ensure_open().await?;

        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| {
                InferenceError::BackendUnavailable("remote engine shutting down".to_string())
            })?;

        let correlation = self.next_correlation();
        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        self.routes.lock().await.insert(correlation, tx);

        let engine_request = EngineRequest {
            correlation,
            prompt: request.prompt.clone(),
            params: request.params.clone(),
        };

        if let Err(e) = self.transport.send(engine_request).await {
            self.routes.lock().await.remove(&correlation);
            return Err(e);
        }

        tracing::debug!("RemoteEngine: submitted request correlation={}", correlation);

        Ok(Box::pin(RouteStream {
            inner: ReceiverStream::new(rx),
            _permit: permit,
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!("RemoteEngine: shutting down provider");

        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.routes.lock().await.clear();
        *self.state.write().await = ChannelState::Closed;
        Ok(())
    }
}

// ============================================================================
// RouteStream
// ============================================================================

/// Consumer side of one request's route.
///
/// Holds the in-flight permit for the request's whole lifetime; dropping
/// the stream (drained or abandoned) releases the slot.
struct RouteStream {
    inner: ReceiverStream<Result<Token>>,
    _permit: OwnedSemaphorePermit,
}

impl Stream for RouteStream {
    type Item = Result<Token>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::orchestrator::engine::EngineFrame;
    use crate::orchestrator::params;
    use crate::orchestrator::types::GenerationRequest;

    /// Loopback transport: the test plays the engine, feeding frames (or a
    /// failure) into the channel the reader consumes.
    struct LoopbackTransport {
        sent: Mutex<Vec<EngineRequest>>,
        frames: Mutex<mpsc::UnboundedReceiver<Result<Option<EngineFrame>>>>,
        opened: AtomicU64,
    }

    struct EngineHandle {
        frames: mpsc::UnboundedSender<Result<Option<EngineFrame>>>,
    }

    impl EngineHandle {
        fn emit(&self, correlation: CorrelationId, text: &str) {
            self.frames
                .send(Ok(Some(EngineFrame {
                    correlation,
                    text: text.to_string(),
                })))
                .unwrap();
        }

        fn fail(&self, message: &str) {
            self.frames
                .send(Err(InferenceError::Stream(message.to_string())))
                .unwrap();
        }
    }

    fn loopback() -> (Arc<LoopbackTransport>, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(LoopbackTransport {
                sent: Mutex::new(Vec::new()),
                frames: Mutex::new(rx),
                opened: AtomicU64::new(0),
            }),
            EngineHandle { frames: tx },
        )
    }

    #[async_trait]
    impl EngineTransport for LoopbackTransport {
        async fn open(&self) -> Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, request: EngineRequest) -> Result<()> {
            self.sent.lock().await.push(request);
            Ok(())
        }

        async fn recv(&self) -> Result<Option<EngineFrame>> {
            match self.frames.lock().await.recv().await {
                Some(item) => item,
                None => Ok(None),
            }
        }
    }

    fn prepared() -> PreparedRequest {
        PreparedRequest {
            prompt: "What is 2+2?<|im_start|>assistant".to_string(),
            params: params::build(&GenerationRequest::default(), 2, None, None),
        }
    }

    async fn submitted(transport: &LoopbackTransport, index: usize) -> EngineRequest {
        // The send happens before stream() returns, so the entry is there.
        transport.sent.lock().await[index].clone()
    }

    #[tokio::test]
    async fn test_stream_before_initialize_is_unavailable() {
        let (transport, _engine) = loopback();
        let provider = RemoteEngineProvider::new(transport, RemoteConfig::new());

        let result = provider.stream(&prepared()).await;
        assert!(matches!(result, Err(InferenceError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (transport, _engine) = loopback();
        let provider = RemoteEngineProvider::new(Arc::clone(&transport) as _, RemoteConfig::new());

        provider.initialize().await.unwrap();
        provider.initialize().await.unwrap();

        assert!(provider.is_available().await);
        assert_eq!(transport.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sentinel_maps_to_one_empty_increment_then_end() {
        let (transport, engine) = loopback();
        let provider = RemoteEngineProvider::new(Arc::clone(&transport) as _, RemoteConfig::new());
        provider.initialize().await.unwrap();

        let mut stream = provider.stream(&prepared()).await.unwrap();
        let correlation = submitted(&transport, 0).await.correlation;

        for text in ["4", " is", " the", " answer", STOP_TOKEN] {
            engine.emit(correlation, text);
        }

        let mut observed = Vec::new();
        while let Some(item) = stream.next().await {
            observed.push(item.unwrap().text);
        }

        assert_eq!(observed, vec!["4", " is", " the", " answer", ""]);
    }

    #[tokio::test]
    async fn test_correlation_ids_are_monotonic_and_carry_pid() {
        let (transport, _engine) = loopback();
        let provider = RemoteEngineProvider::new(Arc::clone(&transport) as _, RemoteConfig::new());
        provider.initialize().await.unwrap();

        let _first = provider.stream(&prepared()).await.unwrap();
        let _second = provider.stream(&prepared()).await.unwrap();

        let a = submitted(&transport, 0).await.correlation;
        let b = submitted(&transport, 1).await.correlation;

        assert_eq!(a.pid, std::process::id());
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(a.to_string(), format!("{}1", std::process::id()));
    }

    #[tokio::test]
    async fn test_interleaved_correlations_keep_per_request_order() {
        let (transport, engine) = loopback();
        let provider = RemoteEngineProvider::new(Arc::clone(&transport) as _, RemoteConfig::new());
        provider.initialize().await.unwrap();

        let mut first = provider.stream(&prepared()).await.unwrap();
        let mut second = provider.stream(&prepared()).await.unwrap();
        let a = submitted(&transport, 0).await.correlation;
        let b = submitted(&transport, 1).await.correlation;

        engine.emit(a, "a1");
        engine.emit(b, "b1");
        engine.emit(a, "a2");
        engine.emit(b, "b2");
        engine.emit(a, STOP_TOKEN);
        engine.emit(b, STOP_TOKEN);

        let mut first_texts = Vec::new();
        while let Some(item) = first.next().await {
            first_texts.push(item.unwrap().text);
        }
        let mut second_texts = Vec::new();
        while let Some(item) = second.next().await {
            second_texts.push(item.unwrap().text);
        }

        assert_eq!(first_texts, vec!["a1", "a2", ""]);
        assert_eq!(second_texts, vec!["b1", "b2", ""]);
    }

    #[tokio::test]
    async fn test_abandoned_stream_leaves_channel_usable() {
        let (transport, engine) = loopback();
        let provider = RemoteEngineProvider::new(Arc::clone(&transport) as _, RemoteConfig::new());
        provider.initialize().await.unwrap();

        let mut abandoned = provider.stream(&prepared()).await.unwrap();
        let mut kept = provider.stream(&prepared()).await.unwrap();
        let a = submitted(&transport, 0).await.correlation;
        let b = submitted(&transport, 1).await.correlation;

        engine.emit(a, "first");
        assert_eq!(abandoned.next().await.unwrap().unwrap().text, "first");
        drop(abandoned);

        // Frames for the dead route are discarded; the live one is served.
        engine.emit(a, "ignored");
        engine.emit(a, STOP_TOKEN);
        engine.emit(b, "still");
        engine.emit(b, " here");
        engine.emit(b, STOP_TOKEN);

        let mut kept_texts = Vec::new();
        while let Some(item) = kept.next().await {
            kept_texts.push(item.unwrap().text);
        }
        assert_eq!(kept_texts, vec!["still", " here", ""]);
    }

    #[tokio::test]
    async fn test_channel_failure_surfaces_and_marks_unavailable() {
        let (transport, engine) = loopback();
        let provider = RemoteEngineProvider::new(Arc::clone(&transport) as _, RemoteConfig::new());
        provider.initialize().await.unwrap();

        let mut stream = provider.stream(&prepared()).await.unwrap();
        let correlation = submitted(&transport, 0).await.correlation;

        engine.emit(correlation, "partial");
        engine.fail("engine went away");

        assert_eq!(stream.next().await.unwrap().unwrap().text, "partial");
        assert!(matches!(
            stream.next().await,
            Some(Err(InferenceError::Stream(_)))
        ));
        assert!(stream.next().await.is_none());

        // The shared channel is gone for subsequent requests too.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while provider.is_available().await {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = provider.stream(&prepared()).await;
        assert!(matches!(result, Err(InferenceError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_non_streaming_concatenates_without_sentinel() {
        let (transport, engine) = loopback();
        let provider = RemoteEngineProvider::new(Arc::clone(&transport) as _, RemoteConfig::new());
        provider.initialize().await.unwrap();

        let provider = Arc::new(provider);
        let drained = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.generate(&prepared()).await })
        };

        // Wait for the submit, then play the engine side.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while transport.sent.lock().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let correlation = submitted(&transport, 0).await.correlation;
        engine.emit(correlation, "4 is");
        engine.emit(correlation, " the answer");
        engine.emit(correlation, STOP_TOKEN);

        let text = drained.await.unwrap().unwrap();
        assert_eq!(text, "4 is the answer");
        assert!(!text.contains(STOP_TOKEN));
    }

    #[tokio::test]
    async fn test_in_flight_limit_bounds_concurrency() {
        let (transport, engine) = loopback();
        let provider = RemoteEngineProvider::new(
            Arc::clone(&transport) as _,
            RemoteConfig::new().with_max_in_flight(1),
        );
        provider.initialize().await.unwrap();

        let mut first = provider.stream(&prepared()).await.unwrap();

        // The second request must wait for the first stream's slot.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), provider.stream(&prepared())).await;
        assert!(blocked.is_err());

        let correlation = submitted(&transport, 0).await.correlation;
        engine.emit(correlation, STOP_TOKEN);
        assert_eq!(first.next().await.unwrap().unwrap().text, "");
        assert!(first.next().await.is_none());
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(5), provider.stream(&prepared()))
            .await
            .expect("slot should free after the first stream is dropped");
        assert!(second.is_ok());
    }
}
