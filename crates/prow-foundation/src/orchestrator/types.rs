//! Core types shared across the orchestration layer.
//!
//! Everything here is provider-agnostic: the same [`GenerationRequest`]
//! flows through the front door whether the backend is an in-process model
//! or a remote inference engine, and both executors speak the same
//! [`TokenStream`] contract back to the caller.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Unified error type for the orchestration layer.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The inbound request is malformed (e.g. neither prompt nor messages).
    /// Raised before any backend work happens.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The backend cannot serve requests right now: local model not
    /// initialized, or the remote channel is not established / has failed.
    /// Not retried here; retry policy belongs to the caller.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend raised while generating. Increments already yielded on a
    /// stream are not retracted; the stream terminates with this error.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The streaming transport misbehaved mid-stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Tokenizer encode/decode/template failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Invalid wiring or configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, InferenceError>;

// ============================================================================
// Conversation types
// ============================================================================

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// GenerationRequest
// ============================================================================

/// The inbound request shape.
///
/// Exactly one of `messages` / `prompt` must resolve to non-empty content;
/// the [`RequestNormalizer`](super::normalizer::RequestNormalizer) rejects
/// requests where neither does. Every sampling field is optional and falls
/// back to a process-wide default when absent (see
/// [`params`](super::params)).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationRequest {
    /// Ordered conversation turns. Order is meaningful.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Optional retrieval context, woven into the formatted prompt.
    #[serde(default)]
    pub context: Option<String>,

    /// Explicit raw prompt. When present, `messages` are ignored.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Token budget. Defaults to 500 when unset.
    #[serde(default)]
    pub max_tokens: Option<usize>,

    /// Alternate token-budget field accepted for backend compatibility.
    /// Defaults to 500 when unset.
    #[serde(default)]
    pub max_new_tokens: Option<usize>,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default)]
    pub top_p: Option<f64>,

    #[serde(default)]
    pub top_k: Option<usize>,

    #[serde(default)]
    pub repetition_penalty: Option<f32>,

    #[serde(default)]
    pub no_repeat_ngram_size: Option<usize>,

    #[serde(default)]
    pub do_sample: Option<bool>,

    /// Incremental streaming vs one aggregated response.
    #[serde(default)]
    pub stream: Option<bool>,
}

impl GenerationRequest {
    /// Create a request from conversation turns.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Create a request from a raw prompt.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }
}

// ============================================================================
// Streaming types
// ============================================================================

/// One decoded text increment of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
}

impl Token {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A lazy, finite, forward-only sequence of text increments.
///
/// Exclusively owned by the executor that produced it until fully drained;
/// draining is what releases the underlying worker or stream route. Not
/// safe for concurrent draining by multiple readers.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<Token>> + Send>>;

// ============================================================================
// Outbound shapes
// ============================================================================

/// Non-streaming response body.
///
/// Two historically distinct call paths produced two wire shapes: a plain
/// string for chat-template backends and a single-field wrapper for raw
/// backends. Callers depend on both, so the asymmetry is kept, but as
/// explicitly tagged variants of one type rather than an untyped value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CompletionBody {
    /// Plain concatenated text (chat-template backends).
    Chat(String),
    /// Single-field wrapper (raw backends).
    Raw { text: String },
}

impl CompletionBody {
    /// The text either variant carries.
    pub fn text(&self) -> &str {
        match self {
            CompletionBody::Chat(text) => text,
            CompletionBody::Raw { text } => text,
        }
    }
}

/// What the front door hands back to the caller.
pub enum CompletionOutput {
    /// The lazy increment sequence, forwarded as-is.
    Stream(TokenStream),
    /// The fully drained, aggregated response.
    Complete(CompletionBody),
}

impl std::fmt::Debug for CompletionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionOutput::Stream(_) => f.write_str("CompletionOutput::Stream(..)"),
            CompletionOutput::Complete(body) => {
                f.debug_tuple("CompletionOutput::Complete").field(body).finish()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
