//! In-process streaming executor.
//!
//! Runs generation against an in-process [`CausalModel`] on a dedicated
//! blocking worker and exposes the output as a lazy [`TokenStream`]. The
//! worker and the consumer communicate through one bounded channel: the
//! worker decodes each sampled token and pushes the text increment, the
//! consumer blocks on the pull side until the next increment is ready.
//!
//! ## Worker lifecycle
//!
//! The worker runs to completion independently of the consumer. When the
//! channel is exhausted the stream joins the worker before reporting
//! end-of-stream, so a fully drained stream guarantees the worker thread
//! has exited. A consumer that abandons the stream early drops the
//! receiver; the worker notices on its next send and cancels the rest of
//! the loop, and the bounded channel caps how far it can run ahead of a
//! slow consumer in the meantime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::backend::{InferenceBackend, PreparedRequest};
use super::engine::{CausalModel, ChatTokenizer};
use super::params::GenerationParameters;
use super::types::{InferenceError, Result, Token, TokenStream};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the local executor.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Capacity of the worker-to-consumer handoff channel. Bounds how much
    /// undelivered output an abandoned or slow-drained worker can buffer.
    pub stream_buffer: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self { stream_buffer: 32 }
    }
}

impl LocalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }
}

// ============================================================================
// LocalModelProvider
// ============================================================================

/// [`InferenceBackend`] over an in-process model and tokenizer.
///
/// One generation call owns the model for its duration; overlapping calls
/// on the same provider are serialized by the deployment, not here.
pub struct LocalModelProvider {
    model: Arc<dyn CausalModel>,
    tokenizer: Arc<dyn ChatTokenizer>,
    config: LocalConfig,
    initialized: Arc<RwLock<bool>>,
}

impl std::fmt::Debug for LocalModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalModelProvider")
            .field("model", &self.model.name())
            .field("config", &self.config)
            .finish()
    }
}

impl LocalModelProvider {
    pub fn new(
        model: Arc<dyn CausalModel>,
        tokenizer: Arc<dyn ChatTokenizer>,
        config: LocalConfig,
    ) -> Self {
        Self {
            model,
            tokenizer,
            config,
            initialized: Arc::new(RwLock::new(false)),
        }
    }

    async fn ensure_ready(&self) -> Result<()> {
        if !*self.initialized.read().await {
            return Err(InferenceError::BackendUnavailable(
                "local model provider not initialized, call initialize() first".to_string(),
            ));
        }
        Ok(())
    }

    /// Start generation over already-encoded input and return the lazy
    /// increment sequence immediately.
    fn stream_ids(&self, input_ids: Vec<u32>, params: GenerationParameters) -> TokenStream {
        let model = Arc::clone(&self.model);
        let tokenizer = Arc::clone(&self.tokenizer);
        let (tx, rx) = mpsc::channel::<Result<Token>>(self.config.stream_buffer);

        let worker = tokio::task::spawn_blocking(move || {
            let mut emit = |token_id: u32| -> bool {
                match tokenizer.decode(&[token_id], true) {
                    Ok(text) => tx.blocking_send(Ok(Token::new(text))).is_ok(),
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        false
                    }
                }
            };

            if let Err(e) = model.generate(&input_ids, &params, &mut emit) {
                // Consumer may already be gone; nothing to do then.
                let _ = tx.blocking_send(Err(e));
            }
        });

        Box::pin(WorkerStream {
            rx,
            worker: Some(worker),
        })
    }
}

#[async_trait]
impl InferenceBackend for LocalModelProvider {
    fn name(&self) -> &str {
        "LocalModel"
    }

    async fn initialize(&self) -> Result<()> {
        tracing::info!("LocalModel: ready with model='{}'", self.model.name());
        *self.initialized.write().await = true;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        *self.initialized.read().await
    }

    /// Non-streaming variant: same generation call, run to completion on a
    /// blocking task, full output decoded with special tokens stripped.
    async fn generate(&self, request: &PreparedRequest) -> Result<String> {
        self.ensure_ready().await?;

        let input_ids = self.tokenizer.encode(&request.prompt)?;
        let model = Arc::clone(&self.model);
        let tokenizer = Arc::clone(&self.tokenizer);
        let params = request.params.clone();

        tracing::debug!(
            "LocalModel: generating up to {} tokens over {} input ids",
            params.max_length,
            input_ids.len()
        );

        let handle = tokio::task::spawn_blocking(move || -> Result<String> {
            let mut keep_going = |_: u32| true;
            let generated = model.generate(&input_ids, &params, &mut keep_going)?;
            tokenizer.decode(&generated, true)
        });

        handle.await.map_err(|e| {
            InferenceError::Generation(format!("generation worker panicked: {}", e))
        })?
    }

    async fn stream(&self, request: &PreparedRequest) -> Result<TokenStream> {
        self.ensure_ready().await?;

        let input_ids = self.tokenizer.encode(&request.prompt)?;
        tracing::debug!(
            "LocalModel: streaming up to {} tokens over {} input ids",
            request.params.max_length,
            input_ids.len()
        );

        Ok(self.stream_ids(input_ids, request.params.clone()))
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!("LocalModel: shutting down provider");
        *self.initialized.write().await = false;
        Ok(())
    }
}

// ============================================================================
// WorkerStream
// ============================================================================

/// Consumer side of the handoff channel.
///
/// Yields increments as the worker produces them. Once the channel drains,
/// the worker handle is polled to completion before end-of-stream is
/// reported: no orphaned worker survives a fully drained stream, and a
/// worker panic surfaces as a final error item.
struct WorkerStream {
    rx: mpsc::Receiver<Result<Token>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream for WorkerStream {
    type Item = Result<Token>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => match this.worker.as_mut() {
                Some(handle) => match Pin::new(handle).poll(cx) {
                    Poll::Ready(join_result) => {
                        this.worker = None;
                        match join_result {
                            Ok(()) => Poll::Ready(None),
                            Err(e) => Poll::Ready(Some(Err(InferenceError::Generation(
                                format!("generation worker panicked: {}", e),
                            )))),
                        }
                    }
                    Poll::Pending => Poll::Pending,
                },
                None => Poll::Ready(None),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::orchestrator::params;
    use crate::orchestrator::types::{ChatMessage, GenerationRequest};

    /// Scripted model: emits a fixed token sequence, honors the
    /// termination set and the callback's cancellation signal.
    struct ScriptedModel {
        script: Vec<u32>,
        finished: Arc<AtomicBool>,
        fail_after: Option<usize>,
    }

    impl ScriptedModel {
        fn new(script: Vec<u32>) -> Self {
            Self {
                script,
                finished: Arc::new(AtomicBool::new(false)),
                fail_after: None,
            }
        }

        fn failing_after(mut self, emitted: usize) -> Self {
            self.fail_after = Some(emitted);
            self
        }
    }

    impl CausalModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(
            &self,
            _input_ids: &[u32],
            params: &GenerationParameters,
            on_token: &mut dyn FnMut(u32) -> bool,
        ) -> Result<Vec<u32>> {
            let mut generated = Vec::new();
            for (index, &token_id) in self.script.iter().enumerate() {
                if Some(index) == self.fail_after {
                    self.finished.store(true, Ordering::SeqCst);
                    return Err(InferenceError::Generation("backend raised".into()));
                }
                if generated.len() >= params.max_length || params.is_terminator(token_id) {
                    break;
                }
                if !on_token(token_id) {
                    break;
                }
                generated.push(token_id);
            }
            self.finished.store(true, Ordering::SeqCst);
            Ok(generated)
        }
    }

    /// Tokenizer stub: token id n decodes to "<n>", ids >= 1000 count as
    /// special and vanish when stripping is requested.
    struct StubTokenizer;

    impl ChatTokenizer for StubTokenizer {
        fn encode(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(vec![1, 2, 3])
        }

        fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
            Ok(ids
                .iter()
                .filter(|&&id| !(skip_special_tokens && id >= 1000))
                .map(|id| format!("<{}>", id))
                .collect())
        }

        fn eos_token_id(&self) -> u32 {
            2
        }

        fn pad_token_id(&self) -> Option<u32> {
            Some(0)
        }

        fn token_to_id(&self, _token: &str) -> Option<u32> {
            None
        }

        fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String> {
            Ok(messages
                .iter()
                .map(|m| m.content.clone())
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    fn prepared(max_tokens: usize) -> PreparedRequest {
        let request = GenerationRequest::default().with_max_tokens(max_tokens);
        PreparedRequest {
            prompt: "hello".to_string(),
            params: params::build(&request, 2, None, Some(0)),
        }
    }

    fn provider(model: ScriptedModel, buffer: usize) -> LocalModelProvider {
        LocalModelProvider::new(
            Arc::new(model),
            Arc::new(StubTokenizer),
            LocalConfig::new().with_stream_buffer(buffer),
        )
    }

    #[tokio::test]
    async fn test_calls_fail_before_initialize() {
        let provider = provider(ScriptedModel::new(vec![10, 11]), 8);

        let result = provider.generate(&prepared(16)).await;
        assert!(matches!(result, Err(InferenceError::BackendUnavailable(_))));

        let result = provider.stream(&prepared(16)).await;
        assert!(matches!(result, Err(InferenceError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stream_concat_matches_non_streaming() {
        let model = ScriptedModel::new(vec![10, 11, 12, 13]);
        let provider = provider(model, 8);
        provider.initialize().await.unwrap();

        let non_streaming = provider.generate(&prepared(16)).await.unwrap();

        let mut stream = provider.stream(&prepared(16)).await.unwrap();
        let mut concatenated = String::new();
        while let Some(item) = stream.next().await {
            concatenated.push_str(&item.unwrap().text);
        }

        assert_eq!(concatenated, non_streaming);
        assert_eq!(concatenated, "<10><11><12><13>");
    }

    #[tokio::test]
    async fn test_drained_stream_means_worker_exited() {
        let model = ScriptedModel::new(vec![10, 11, 12]);
        let finished = model.finished.clone();
        let provider = provider(model, 8);
        provider.initialize().await.unwrap();

        let mut stream = provider.stream(&prepared(16)).await.unwrap();
        while let Some(item) = stream.next().await {
            item.unwrap();
        }

        // End-of-stream is only reported after the worker joins.
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_max_length_bounds_generation() {
        let model = ScriptedModel::new((10..200).collect());
        let provider = provider(model, 8);
        provider.initialize().await.unwrap();

        let mut stream = provider.stream(&prepared(5)).await.unwrap();
        let mut count = 0;
        while let Some(item) = stream.next().await {
            item.unwrap();
            count += 1;
        }

        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_terminator_halts_stream() {
        // 2 is the eos id in the stub tokenizer's world.
        let model = ScriptedModel::new(vec![10, 11, 2, 12]);
        let provider = provider(model, 8);
        provider.initialize().await.unwrap();

        let mut stream = provider.stream(&prepared(16)).await.unwrap();
        let mut texts = Vec::new();
        while let Some(item) = stream.next().await {
            texts.push(item.unwrap().text);
        }

        assert_eq!(texts, vec!["<10>", "<11>"]);
    }

    #[tokio::test]
    async fn test_non_streaming_strips_special_tokens() {
        let model = ScriptedModel::new(vec![10, 1000, 11]);
        let provider = provider(model, 8);
        provider.initialize().await.unwrap();

        let text = provider.generate(&prepared(16)).await.unwrap();
        assert_eq!(text, "<10><11>");
    }

    #[tokio::test]
    async fn test_mid_stream_failure_surfaces_after_partial_output() {
        let model = ScriptedModel::new(vec![10, 11, 12, 13]).failing_after(2);
        let provider = provider(model, 8);
        provider.initialize().await.unwrap();

        let mut stream = provider.stream(&prepared(16)).await.unwrap();
        let mut yielded = Vec::new();
        let mut failure = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) => yielded.push(token.text),
                Err(e) => failure = Some(e),
            }
        }

        assert_eq!(yielded, vec!["<10>", "<11>"]);
        assert!(matches!(failure, Some(InferenceError::Generation(_))));
    }

    #[tokio::test]
    async fn test_abandoned_stream_cancels_worker() {
        let model = ScriptedModel::new((10..500).collect());
        let finished = model.finished.clone();
        // Tiny buffer so the worker cannot run far ahead of the consumer.
        let provider = provider(model, 2);
        provider.initialize().await.unwrap();

        let mut stream = provider.stream(&prepared(1000)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "<10>");
        drop(stream);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !finished.load(Ordering::SeqCst) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker did not exit after the stream was abandoned"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
