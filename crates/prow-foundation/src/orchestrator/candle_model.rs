//! Candle-backed local model.
//!
//! Loads quantized GGUF weights and implements [`CausalModel`] with a
//! plain autoregressive loop: ingest the prompt once, then sample one
//! token per forward pass, honoring the normalized sampling parameters
//! and the termination set. All of it runs on whichever blocking thread
//! the executor dedicates to the call.

use std::path::PathBuf;
use std::sync::Mutex;

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;

use super::engine::CausalModel;
use super::params::GenerationParameters;
use super::types::{InferenceError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Load-time configuration for the candle model.
#[derive(Debug, Clone)]
pub struct CandleModelConfig {
    /// Path to the GGUF weights file.
    pub model_path: PathBuf,
    /// Preferred device: `"cuda"`, `"metal"`, or `"cpu"`. `"auto"` probes
    /// in that order and falls back to CPU.
    pub device: String,
    /// CUDA device ordinal.
    pub cuda_device_id: usize,
    /// Sampling seed.
    pub seed: u64,
    /// Window of recent tokens the repetition penalty looks at.
    pub repeat_last_n: usize,
}

impl CandleModelConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            device: "auto".to_string(),
            cuda_device_id: 0,
            seed: 299_792_458,
            repeat_last_n: 64,
        }
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = device.to_string();
        self
    }

    pub fn with_cuda_device(mut self, id: usize) -> Self {
        self.cuda_device_id = id;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_repeat_last_n(mut self, window: usize) -> Self {
        self.repeat_last_n = window;
        self
    }
}

// ============================================================================
// CandleChatModel
// ============================================================================

/// Quantized llama-family model behind the [`CausalModel`] seam.
pub struct CandleChatModel {
    /// KV cache lives inside the weights, so forward passes need
    /// exclusive access. One generation call holds the lock end to end.
    model: Mutex<ModelWeights>,
    device: Device,
    config: CandleModelConfig,
    model_name: String,
}

impl std::fmt::Debug for CandleChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleChatModel")
            .field("model_name", &self.model_name)
            .field("model_path", &self.config.model_path)
            .field("device", &self.config.device)
            .finish()
    }
}

impl CandleChatModel {
    /// Load GGUF weights onto the configured device. Blocking; call from
    /// a blocking context during wiring, not from a request path.
    pub fn load(config: CandleModelConfig) -> Result<Self> {
        if !config.model_path.exists() {
            return Err(InferenceError::Config(format!(
                "model path not found: {}",
                config.model_path.display()
            )));
        }

        let device = select_device(&config)?;

        let mut file = std::fs::File::open(&config.model_path)
            .map_err(|e| InferenceError::Config(format!("failed to open GGUF file: {}", e)))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| InferenceError::Config(format!("failed to parse GGUF file: {}", e)))?;

        let model_name = content
            .metadata
            .get("general.name")
            .and_then(|value| match value {
                gguf_file::Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| {
                config
                    .model_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            });

        let model = ModelWeights::from_gguf(content, &mut file, &device)
            .map_err(|e| InferenceError::Config(format!("failed to load model weights: {}", e)))?;

        tracing::info!(
            "CandleModel: loaded '{}' from {}",
            model_name,
            config.model_path.display()
        );

        Ok(Self {
            model: Mutex::new(model),
            device,
            config,
            model_name,
        })
    }

    fn sampling(&self, params: &GenerationParameters) -> Sampling {
        if !params.do_sample || params.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        Sampling::TopKThenTopP {
            k: params.top_k,
            p: params.top_p,
            temperature: params.temperature,
        }
    }

    /// Apply the repetition penalty and the no-repeat-ngram ban to one
    /// step's logits.
    fn constrain_logits(
        &self,
        logits: Tensor,
        all_tokens: &[u32],
        params: &GenerationParameters,
    ) -> Result<Tensor> {
        let logits = if params.repetition_penalty != 1.0 && !all_tokens.is_empty() {
            let start = all_tokens.len().saturating_sub(self.config.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                params.repetition_penalty,
                &all_tokens[start..],
            )
            .map_err(|e| InferenceError::Generation(format!("repeat penalty failed: {}", e)))?
        } else {
            logits
        };

        let banned = banned_next_tokens(all_tokens, params.no_repeat_ngram_size);
        if banned.is_empty() {
            return Ok(logits);
        }

        let mut values = logits
            .to_vec1::<f32>()
            .map_err(|e| InferenceError::Generation(format!("logits readback failed: {}", e)))?;
        for token_id in banned {
            if let Some(value) = values.get_mut(token_id as usize) {
                *value = f32::NEG_INFINITY;
            }
        }
        let length = values.len();
        Tensor::from_vec(values, length, logits.device())
            .map_err(|e| InferenceError::Generation(format!("logits rebuild failed: {}", e)))
    }

    fn forward_step(
        &self,
        model: &mut ModelWeights,
        tokens: &[u32],
        position: usize,
    ) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| InferenceError::Generation(format!("tensor creation failed: {}", e)))?;
        let logits = model
            .forward(&input, position)
            .map_err(|e| InferenceError::Generation(format!("forward pass failed: {}", e)))?;
        logits
            .squeeze(0)
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(|e| InferenceError::Generation(format!("logits shaping failed: {}", e)))
    }
}

impl CausalModel for CandleChatModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn generate(
        &self,
        input_ids: &[u32],
        params: &GenerationParameters,
        on_token: &mut dyn FnMut(u32) -> bool,
    ) -> Result<Vec<u32>> {
        if input_ids.is_empty() {
            return Err(InferenceError::Generation(
                "cannot generate from an empty prompt encoding".to_string(),
            ));
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| InferenceError::Generation("model lock poisoned".to_string()))?;

        let mut logits_processor =
            LogitsProcessor::from_sampling(self.config.seed, self.sampling(params));

        let mut all_tokens = input_ids.to_vec();
        let mut generated: Vec<u32> = Vec::new();

        // Ingest the whole prompt in one pass, then decode token by token.
        let mut logits = self.forward_step(&mut model, input_ids, 0)?;

        while generated.len() < params.max_length {
            let constrained = self.constrain_logits(logits, &all_tokens, params)?;
            let next_token = logits_processor
                .sample(&constrained)
                .map_err(|e| InferenceError::Generation(format!("sampling failed: {}", e)))?;

            if params.is_terminator(next_token) {
                break;
            }

            all_tokens.push(next_token);
            generated.push(next_token);

            if !on_token(next_token) {
                break;
            }
            if generated.len() >= params.max_length {
                break;
            }

            logits = self.forward_step(&mut model, &[next_token], all_tokens.len() - 1)?;
        }

        Ok(generated)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn select_device(config: &CandleModelConfig) -> Result<Device> {
    let preference = config.device.to_lowercase();

    if preference == "cpu" {
        return Ok(Device::Cpu);
    }

    if preference == "cuda" || preference == "auto" {
        match Device::new_cuda(config.cuda_device_id) {
            Ok(device) => {
                tracing::info!("CandleModel: using CUDA device {}", config.cuda_device_id);
                return Ok(device);
            }
            Err(e) => {
                if preference == "cuda" {
                    tracing::warn!("CandleModel: CUDA unavailable: {}", e);
                }
            }
        }
    }

    if preference == "metal" || preference == "auto" {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("CandleModel: using Metal device");
                return Ok(device);
            }
            Err(e) => {
                if preference == "metal" {
                    tracing::warn!("CandleModel: Metal unavailable: {}", e);
                }
            }
        }
    }

    tracing::info!("CandleModel: using CPU (no GPU available)");
    Ok(Device::Cpu)
}

/// Token ids that would complete an ngram already present in `tokens`.
///
/// `ngram == 0` disables the ban. For `ngram == 1` every previously seen
/// token is banned, matching the usual no-repeat-ngram semantics.
fn banned_next_tokens(tokens: &[u32], ngram: usize) -> Vec<u32> {
    if ngram == 0 || tokens.len() + 1 < ngram {
        return Vec::new();
    }

    let prefix = &tokens[tokens.len() + 1 - ngram..];
    let mut banned = Vec::new();
    for window in tokens.windows(ngram) {
        if &window[..ngram - 1] == prefix {
            banned.push(window[ngram - 1]);
        }
    }
    banned
}

// ============================================================================
// Tests
// ============================================================================
