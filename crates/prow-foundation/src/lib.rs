//! # prow-foundation
//!
//! Foundation layer for **prow**, a request-orchestration service that sits
//! in front of a large-language-model inference backend. The crate turns
//! heterogeneous client requests (chat message lists or raw prompts) into a
//! single normalized generation call and hands the result back either as a
//! lazy token stream or as one aggregated response.
//!
//! The interesting machinery lives in [`orchestrator`]:
//!
//! - prompt construction from structured conversation state
//! - sampling-parameter normalization with process-wide defaults
//! - a worker-thread streaming executor for in-process models
//! - a persistent-stream client for remote inference engines
//! - the front door that validates, normalizes, and dispatches requests

pub mod orchestrator;

pub use orchestrator::{
    ChatMessage, ChatRole, CompletionBody, CompletionOutput, GenerationRequest, InferenceError,
    RequestNormalizer, Token, TokenStream,
};
