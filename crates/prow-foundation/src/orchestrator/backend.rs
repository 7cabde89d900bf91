//! The unified backend trait both executors implement.
//!
//! [`InferenceBackend`] is the seam between the front door and the two
//! execution paths: the in-process worker-thread executor
//! ([`LocalModelProvider`](super::local::LocalModelProvider)) and the
//! persistent-stream remote client
//! ([`RemoteEngineProvider`](super::remote::RemoteEngineProvider)). The
//! trait is object-safe so deployments pick an executor at wiring time and
//! hand the front door an `Arc<dyn InferenceBackend>`.
//!
//! ## Streaming contract
//!
//! `stream` returns a [`TokenStream`]: a pinned, boxed, `Send` async
//! sequence of decoded text increments. Increments within one call arrive
//! in generation order; the stream is finite and single-consumer, and
//! draining it to the end is what releases the worker thread or stream
//! route behind it. `generate` is the aggregated variant of the same call.
//!
//! ## Lifecycle
//!
//! Construct, `initialize` once (load/connect), serve `generate`/`stream`
//! calls, `shutdown` to release resources. `generate` and `stream` fail
//! with `BackendUnavailable` outside the initialized window.

use async_trait::async_trait;

use super::params::GenerationParameters;
use super::types::{Result, TokenStream};

/// A fully normalized generation call, ready for an executor.
///
/// Produced by the front door; immutable and consumed by exactly one
/// backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    /// The flattened prompt, continuation marker included.
    pub prompt: String,
    /// Normalized sampling parameters.
    pub params: GenerationParameters,
}

/// The execution interface for one inference backend.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Prepare the backend: load the model or establish the engine
    /// channel. Called once after construction.
    async fn initialize(&self) -> Result<()>;

    /// Lightweight readiness check; never performs inference.
    async fn is_available(&self) -> bool;

    /// Execute the call and return the complete response text.
    async fn generate(&self, request: &PreparedRequest) -> Result<String>;

    /// Execute the call and return the lazy increment sequence.
    async fn stream(&self, request: &PreparedRequest) -> Result<TokenStream>;

    /// Release the backend's resources. After this, `is_available` reports
    /// false and calls fail with `BackendUnavailable`.
    async fn shutdown(&self) -> Result<()>;
}
