//! Hugging Face tokenizer adapter.
//!
//! Wraps a `tokenizers::Tokenizer` behind the [`ChatTokenizer`] seam and
//! supplies the ChatML template convention used by the chat-compatible
//! request path.

use std::path::Path;

use tokenizers::Tokenizer;

use super::engine::ChatTokenizer;
use super::types::{ChatMessage, ChatRole, InferenceError, Result};

/// Token strings probed, in order, when resolving the end-of-sequence id.
const EOS_CANDIDATES: [&str; 5] = ["</s>", "<|im_end|>", "<|end|>", "<|eot_id|>", "<|endoftext|>"];

/// Token strings probed when resolving the padding id.
const PAD_CANDIDATES: [&str; 2] = ["<pad>", "<|pad|>"];

// Token id 2 is the eos in most Llama-family vocabularies.
const FALLBACK_EOS_ID: u32 = 2;

/// [`ChatTokenizer`] implementation over a `tokenizer.json` vocabulary.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    eos_token_id: u32,
    pad_token_id: Option<u32>,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("eos_token_id", &self.eos_token_id)
            .field("pad_token_id", &self.pad_token_id)
            .finish()
    }
}

impl HfTokenizer {
    /// Wrap an already-loaded tokenizer, resolving special ids from the
    /// vocabulary.
    pub fn new(tokenizer: Tokenizer) -> Self {
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|candidate| tokenizer.token_to_id(candidate))
            .unwrap_or(FALLBACK_EOS_ID);

        let pad_token_id = PAD_CANDIDATES
            .iter()
            .find_map(|candidate| tokenizer.token_to_id(candidate));

        Self {
            tokenizer,
            eos_token_id,
            pad_token_id,
        }
    }

    /// Load `tokenizer.json` from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            InferenceError::Config(format!(
                "failed to load tokenizer from '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::new(tokenizer))
    }

    /// Override the resolved end-of-sequence id.
    pub fn with_eos_token_id(mut self, id: u32) -> Self {
        self.eos_token_id = id;
        self
    }

    fn role_label(role: ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl ChatTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| InferenceError::Tokenizer(format!("encode failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| InferenceError::Tokenizer(format!("decode failed: {}", e)))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// ChatML rendering: each turn framed by `<|im_start|>` / `<|im_end|>`.
    /// The assistant continuation marker the normalizer appends belongs to
    /// this same convention.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str("<|im_start|>");
            prompt.push_str(Self::role_label(message.role));
            prompt.push('\n');
            prompt.push_str(&message.content);
            prompt.push_str("<|im_end|>\n");
        }
        Ok(prompt)
    }
}
