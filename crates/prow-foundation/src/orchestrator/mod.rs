//! Generation Orchestration Module
//!
//! This module is the request-orchestration core of prow. It takes
//! heterogeneous inbound requests, normalizes them into a single prepared
//! generation call, and executes that call on one of two interchangeable
//! backends behind a shared lazy-token-stream contract:
//!
//! - **[`RequestNormalizer`]**, the front door: validation, token-budget
//!   defaults, chat-template vs raw-prompt rendering, continuation-marker
//!   policy, streaming vs aggregated dispatch
//! - **[`LocalModelProvider`]**, the in-process path: a dedicated blocking
//!   worker drives a [`CausalModel`] and streams decoded increments
//!   through a bounded handoff channel
//! - **[`RemoteEngineProvider`]**, the remote path: one persistent
//!   [`EngineTransport`] channel shared by all requests, demultiplexed by
//!   [`CorrelationId`], with the engine's stop-token sentinel filtered out
//!   of client-visible output
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       inbound request                        │
//! │        {messages | prompt, sampling overrides, stream}       │
//! └────────────────────────────┬─────────────────────────────────┘
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RequestNormalizer                       │
//! │   prompt::format_input / ChatTokenizer::apply_chat_template  │
//! │   params::build (overrides over process-wide defaults)       │
//! └──────────────┬─────────────────────────────┬─────────────────┘
//!                │ Arc<dyn InferenceBackend>   │
//!                ▼                             ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │    LocalModelProvider    │   │     RemoteEngineProvider     │
//! │ blocking worker thread   │   │ persistent engine channel    │
//! │ bounded handoff channel  │   │ correlation-id demux, one    │
//! │ join on stream drain     │   │ reader task, sentinel filter │
//! └──────────────┬───────────┘   └──────────────┬───────────────┘
//!                └───────────────┬──────────────┘
//!                                ▼
//!                 TokenStream (lazy, finite, in order)
//!                 forwarded, or drained into one response
//! ```
//!
//! Model weights, tokenizer artifacts, and the remote wire protocol stay
//! behind the collaborator traits in [`engine`]; deployments wire concrete
//! implementations in at startup.

/// Core request/response/error types.
pub mod types;

/// ChatQA conversation-to-prompt rendering.
pub mod prompt;

/// Sampling-parameter normalization and process-wide defaults.
pub mod params;

/// Collaborator seams: in-process model, tokenizer, engine transport.
pub mod engine;

/// Hugging Face tokenizer adapter.
pub mod tokenizer;

/// The backend trait both executors implement.
pub mod backend;

/// In-process worker-thread streaming executor.
pub mod local;

/// Remote streaming client over the persistent engine channel.
pub mod remote;

/// The front door: validation, normalization, dispatch.
pub mod normalizer;

/// Deployment configuration and load-time secrets.
pub mod config;

/// Candle-backed local model.
#[cfg(feature = "candle")]
pub mod candle_model;

// ── Re-exports: core types ──

pub use types::{
    ChatMessage, ChatRole, CompletionBody, CompletionOutput, GenerationRequest, InferenceError,
    Result, Token, TokenStream,
};

// ── Re-exports: components ──

pub use backend::{InferenceBackend, PreparedRequest};
pub use config::{OrchestratorConfig, SecretStore};
pub use engine::{CausalModel, ChatTokenizer, CorrelationId, EngineFrame, EngineRequest, EngineTransport};
pub use local::{LocalConfig, LocalModelProvider};
pub use normalizer::{PromptMode, RequestNormalizer, ASSISTANT_TEMPLATE, DEFAULT_TOKEN_BUDGET};
pub use params::GenerationParameters;
pub use remote::{RemoteConfig, RemoteEngineProvider, STOP_TOKEN};
pub use tokenizer::HfTokenizer;

#[cfg(feature = "candle")]
pub use candle_model::{CandleChatModel, CandleModelConfig};
