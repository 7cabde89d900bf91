//! The front door.
//!
//! [`RequestNormalizer`] is the single entry point for inbound requests.
//! It validates the request, fills defaulted token budgets, decides
//! between chat-template and raw-prompt rendering, appends the assistant
//! continuation marker the deployed convention expects, and dispatches to
//! the configured backend on either the streaming or the aggregated path.
//!
//! ## Prompt conventions
//!
//! Two conventions coexist behind one entry point:
//!
//! - chat-compatible backends get the model family's chat template plus
//!   the `<|im_start|>assistant` continuation marker (raw prompts get the
//!   marker too, so the engine resumes on an assistant turn either way)
//! - everything else gets the ChatQA transcript from
//!   [`prompt::format_input`], whose trailing `Assistant:` cue plays the
//!   same role for that convention
//!
//! ## Response shapes
//!
//! Streaming callers get the lazy sequence untouched. Non-streaming
//! callers get the drained text as [`CompletionBody::Chat`] for
//! chat-compatible deployments and [`CompletionBody::Raw`] otherwise;
//! existing clients depend on both shapes.

use std::sync::Arc;

use super::backend::{InferenceBackend, PreparedRequest};
use super::config::OrchestratorConfig;
use super::engine::ChatTokenizer;
use super::params;
use super::prompt;
use super::types::{
    CompletionBody, CompletionOutput, GenerationRequest, InferenceError, Result,
};

/// Continuation marker for chat-template conventions.
pub const ASSISTANT_TEMPLATE: &str = "<|im_start|>assistant";

/// Extra stop marker resolved from the vocabulary and added to the
/// termination set next to the end-of-sequence id.
pub const EXTRA_STOP_MARKER: &str = "<|eot_id|>";

/// Fallback for both token-budget fields when the request leaves them
/// unset.
pub const DEFAULT_TOKEN_BUDGET: usize = 500;

/// How the inbound request's prompt was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Rendered from the message list.
    ChatTemplate,
    /// Taken from the request's explicit prompt.
    RawPrompt,
}

/// Front door over one configured backend.
pub struct RequestNormalizer {
    backend: Arc<dyn InferenceBackend>,
    tokenizer: Arc<dyn ChatTokenizer>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for RequestNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestNormalizer")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

impl RequestNormalizer {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        tokenizer: Arc<dyn ChatTokenizer>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            config,
        }
    }

    /// Validate and normalize one inbound request.
    ///
    /// Mutates the request in place: token budgets are defaulted and, on
    /// the ChatQA path, the first user turn absorbs the instruction
    /// prefix. Each request must be normalized exactly once.
    pub fn normalize(
        &self,
        request: &mut GenerationRequest,
    ) -> Result<(PromptMode, PreparedRequest)> {
        if request.max_tokens.is_none() {
            request.max_tokens = Some(DEFAULT_TOKEN_BUDGET);
        }
        if request.max_new_tokens.is_none() {
            request.max_new_tokens = Some(DEFAULT_TOKEN_BUDGET);
        }

        let has_prompt = request
            .prompt
            .as_deref()
            .map(|p| !p.is_empty())
            .unwrap_or(false);

        if !has_prompt && request.messages.is_empty() {
            return Err(InferenceError::InvalidRequest(
                "prompt or messages must be provided".to_string(),
            ));
        }

        let mode = if has_prompt {
            PromptMode::RawPrompt
        } else {
            PromptMode::ChatTemplate
        };

        let prompt = match mode {
            PromptMode::RawPrompt => {
                let base = request.prompt.clone().unwrap_or_default();
                self.append_continuation_marker(base)
            }
            PromptMode::ChatTemplate => {
                if self.config.chat_compatible {
                    let rendered = self.tokenizer.apply_chat_template(&request.messages)?;
                    self.append_continuation_marker(rendered)
                } else {
                    // ChatQA transcript; format_input appends its own
                    // assistant cue.
                    let context = request.context.clone().unwrap_or_default();
                    prompt::format_input(&mut request.messages, &context)
                }
            }
        };

        let eos_token_id = self.tokenizer.eos_token_id();
        let extra_stop_id = self.tokenizer.token_to_id(EXTRA_STOP_MARKER);
        let params = params::build(
            request,
            eos_token_id,
            extra_stop_id,
            self.tokenizer.pad_token_id(),
        );

        Ok((mode, PreparedRequest { prompt, params }))
    }

    /// Normalize and execute one request end to end.
    pub async fn handle(&self, mut request: GenerationRequest) -> Result<CompletionOutput> {
        let streaming = request.stream.unwrap_or(self.config.default_stream);
        let (mode, prepared) = self.normalize(&mut request)?;

        tracing::debug!(
            "RequestNormalizer: dispatching {:?} request to {} (streaming={})",
            mode,
            self.backend.name(),
            streaming
        );

        if streaming {
            let stream = self.backend.stream(&prepared).await?;
            return Ok(CompletionOutput::Stream(stream));
        }

        let text = self.backend.generate(&prepared).await?;
        let body = if self.config.chat_compatible {
            CompletionBody::Chat(text)
        } else {
            CompletionBody::Raw { text }
        };
        Ok(CompletionOutput::Complete(body))
    }

    fn append_continuation_marker(&self, prompt: String) -> String {
        if self.config.chat_compatible {
            format!("{}{}", prompt, ASSISTANT_TEMPLATE)
        } else {
            format!("{}{}", prompt, prompt::ASSISTANT_CUE)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
