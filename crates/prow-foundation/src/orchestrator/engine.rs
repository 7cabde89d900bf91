//! Collaborator interfaces the orchestration core consumes.
//!
//! The orchestrator never touches model weights, tokenizer artifacts, or a
//! wire protocol directly. It talks to three seams instead:
//!
//! - [`CausalModel`]: an in-process autoregressive model driven from a
//!   blocking worker thread
//! - [`ChatTokenizer`]: encode/decode plus the chat-template conventions of
//!   the deployed model family
//! - [`EngineTransport`]: a persistent bidirectional stream to a remote
//!   inference engine, multiplexed by correlation id
//!
//! All three are object-safe so deployments can wire concrete
//! implementations in at startup and the core stays provider-agnostic.

use std::fmt;

use async_trait::async_trait;

use super::params::GenerationParameters;
use super::types::{ChatMessage, Result};

// ============================================================================
// CorrelationId
// ============================================================================

/// Routes streamed engine responses back to the request that caused them.
///
/// Process-lifetime unique: a monotonically increasing sequence combined
/// with the process id, assigned once per remote request and never reused.
/// The sequence counter is owned by the client instance that allocates
/// these, so its lifecycle matches the shared channel it multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId {
    pub pid: u32,
    pub seq: u64,
}

impl CorrelationId {
    pub fn new(pid: u32, seq: u64) -> Self {
        Self { pid, seq }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.pid, self.seq)
    }
}

// ============================================================================
// CausalModel
// ============================================================================

/// An in-process autoregressive model.
///
/// `generate` runs the full decoding loop on the calling thread, which is
/// always a dedicated blocking worker: implementations may be arbitrarily
/// CPU- or GPU-heavy and must never be called from an async context
/// directly. The model object is used read-only for the duration of one
/// call; overlapping calls on the same model are not supported and must be
/// serialized by the owner.
pub trait CausalModel: Send + Sync {
    /// Human-readable model name for logs.
    fn name(&self) -> &str;

    /// Run autoregressive generation over `input_ids`.
    ///
    /// Every newly sampled token id is handed to `on_token` before the
    /// next forward pass; returning `false` from the callback cancels the
    /// remainder of the loop (the consumer went away). The full list of
    /// generated ids is returned for whole-sequence decoding.
    ///
    /// Generation halts when a member of `params.eos_token_ids` is
    /// produced, when `params.max_length` tokens have been generated, or
    /// when the callback cancels, whichever comes first.
    fn generate(
        &self,
        input_ids: &[u32],
        params: &GenerationParameters,
        on_token: &mut dyn FnMut(u32) -> bool,
    ) -> Result<Vec<u32>>;
}

// ============================================================================
// ChatTokenizer
// ============================================================================

/// Tokenizer plus the chat conventions of the deployed model family.
pub trait ChatTokenizer: Send + Sync {
    /// Encode text into token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids into text. `skip_special_tokens` strips
    /// eos/pad/template markers from the output.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// End-of-sequence token id.
    fn eos_token_id(&self) -> u32;

    /// Padding token id, when the vocabulary has one.
    fn pad_token_id(&self) -> Option<u32>;

    /// Look up a single token's id, e.g. a model family's stop marker.
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Render a message list into a single prompt using the model
    /// family's chat template. Used by chat-compatible backends; the
    /// ChatQA transcript path does not go through this.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ============================================================================
// EngineTransport
// ============================================================================

/// One request frame submitted over the persistent engine stream.
///
/// Carries everything the engine needs to serve and route the call: the
/// correlation id, the normalized prompt, and the sampling parameters
/// (termination token ids included).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub correlation: CorrelationId,
    pub prompt: String,
    pub params: GenerationParameters,
}

/// One response frame received from the engine.
///
/// Frames belonging to different correlation ids may arrive interleaved;
/// frames for one id arrive in generation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFrame {
    pub correlation: CorrelationId,
    pub text: String,
}

/// Persistent bidirectional stream to a remote inference engine.
///
/// The wire protocol behind this trait is a deployment concern. The
/// contract the orchestrator relies on:
///
/// - `open` is idempotent and must succeed before the first `send`
/// - `send` serializes its own writes; two requests never interleave
///   mid-message on the wire
/// - `recv` yields frames as the engine produces them; `Ok(None)` means
///   the channel closed cleanly
/// - the engine terminates every request's frame sequence with the
///   configured sentinel stop token, including requests that ended on the
///   token budget
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Establish the shared channel. Safe to call more than once.
    async fn open(&self) -> Result<()>;

    /// Submit one request frame.
    async fn send(&self, request: EngineRequest) -> Result<()>;

    /// Receive the next response frame from any in-flight request.
    async fn recv(&self) -> Result<Option<EngineFrame>>;
}
