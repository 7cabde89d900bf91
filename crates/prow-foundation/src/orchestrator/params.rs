//! Sampling-parameter normalization.
//!
//! Merges a request's optional sampling fields with process-wide defaults
//! into one immutable [`GenerationParameters`] value, independent of which
//! backend executes the call. The backend treats the result as read-only
//! for the lifetime of a single generation.

use super::types::GenerationRequest;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_MAX_LENGTH: usize = 512;
pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const DEFAULT_TOP_P: f64 = 0.95;
pub const DEFAULT_TOP_K: usize = 40;
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.0;
pub const DEFAULT_NO_REPEAT_NGRAM_SIZE: usize = 0;
pub const DEFAULT_DO_SAMPLE: bool = true;

// ============================================================================
// GenerationParameters
// ============================================================================

/// Normalized sampling parameters for one generation call.
///
/// Immutable once built. `max_length` is the new-token budget: generation
/// halts when that many tokens have been produced, or when any id in
/// `eos_token_ids` is emitted, whichever happens first.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub do_sample: bool,
    /// Always true; the backends rely on KV caching.
    pub use_cache: bool,
    /// Termination set: the tokenizer's end-of-sequence id plus the model
    /// family's extra stop-marker id. Producing any member halts generation.
    pub eos_token_ids: Vec<u32>,
    pub pad_token_id: Option<u32>,
}

impl GenerationParameters {
    /// Whether `token_id` terminates generation.
    pub fn is_terminator(&self, token_id: u32) -> bool {
        self.eos_token_ids.contains(&token_id)
    }
}

/// Build normalized parameters from a request.
///
/// For each sampling field: the request's value if present, else the
/// documented default. Pure; the only failure mode is upstream (a request
/// that failed to deserialize never reaches this point).
pub fn build(
    request: &GenerationRequest,
    eos_token_id: u32,
    extra_stop_id: Option<u32>,
    pad_token_id: Option<u32>,
) -> GenerationParameters {
    let mut eos_token_ids = vec![eos_token_id];
    if let Some(extra) = extra_stop_id {
        if extra != eos_token_id {
            eos_token_ids.push(extra);
        }
    }

    GenerationParameters {
        max_length: request.max_tokens.unwrap_or(DEFAULT_MAX_LENGTH),
        temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        top_p: request.top_p.unwrap_or(DEFAULT_TOP_P),
        top_k: request.top_k.unwrap_or(DEFAULT_TOP_K),
        repetition_penalty: request
            .repetition_penalty
            .unwrap_or(DEFAULT_REPETITION_PENALTY),
        no_repeat_ngram_size: request
            .no_repeat_ngram_size
            .unwrap_or(DEFAULT_NO_REPEAT_NGRAM_SIZE),
        do_sample: request.do_sample.unwrap_or(DEFAULT_DO_SAMPLE),
        use_cache: true,
        eos_token_ids,
        pad_token_id,
    }
}
