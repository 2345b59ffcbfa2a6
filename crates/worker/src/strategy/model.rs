//! Sequence model strategy
//!
//! Runs a causal language model through an incremental decoding loop and
//! streams the detokenized text as it is produced. The production model is a
//! quantized Llama-family network loaded from a GGUF file with
//! `candle-transformers`; anything implementing [`LanguageModel`] can be
//! plugged in instead.
//!
//! Weights, tokenizer and device are loaded once at startup. Everything that
//! depends on a request (KV cache position, logits processor, detokenizer) is
//! created per call. Forward passes are serialized: one request holds the
//! model for its whole generation, others wait for it on their own compute
//! contexts.

use super::decoder::IncrementalDecoder;
use super::TokenStrategy;
use crate::bridge::TokenSink;
use crate::request::{DecodingMode, GenerationRequest};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;
use parking_lot::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokenizers::Tokenizer;
use tokenrelay_common::config::ModelConfig;
use tokenrelay_common::{RelayError, Result};
use tracing::{debug, info};

/// How often a waiting request rechecks cancellation while the model is busy
const MODEL_LOCK_POLL: Duration = Duration::from_millis(50);

/// End-of-sequence markers used by common tokenizers
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<|eot_id|>", "<|im_end|>"];

/// A causal language model with an internal KV cache
pub trait LanguageModel: Send + 'static {
    /// Logits for the last position of `input` (shape `[1, seq]`), shape `[1, vocab]`
    ///
    /// `index_pos` is the position of the first input token; 0 starts a new
    /// sequence and resets the cache.
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor>;
}

impl LanguageModel for ModelWeights {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        ModelWeights::forward(self, input, index_pos)
    }
}

/// Sampling knobs fixed at startup
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSettings {
    pub seed: u64,
    pub top_p: Option<f64>,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            seed: 299792458,
            top_p: None,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

impl From<&ModelConfig> for SamplingSettings {
    fn from(config: &ModelConfig) -> Self {
        Self {
            seed: config.seed,
            top_p: config.top_p,
            repeat_penalty: config.repeat_penalty,
            repeat_last_n: config.repeat_last_n,
        }
    }
}

impl SamplingSettings {
    fn sampling(&self, mode: DecodingMode) -> Sampling {
        match (mode, self.top_p) {
            (DecodingMode::Greedy, _) => Sampling::ArgMax,
            (DecodingMode::Sampling { temperature }, None) => Sampling::All { temperature },
            (DecodingMode::Sampling { temperature }, Some(p)) => Sampling::TopP { p, temperature },
        }
    }
}

/// Parse a device spec: "cpu", "cuda", "cuda:N", "metal" or "metal:N"
pub fn parse_device(spec: &str) -> Result<Device> {
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal
                .parse::<usize>()
                .map_err(|_| RelayError::config(format!("Invalid device ordinal in {}", spec)))?;
            (kind, ordinal)
        }
        None => (spec, 0),
    };

    match kind.to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(ordinal)
            .map_err(|e| RelayError::model(format!("CUDA device {} unavailable: {}", ordinal, e))),
        "metal" => Device::new_metal(ordinal)
            .map_err(|e| RelayError::model(format!("Metal device {} unavailable: {}", ordinal, e))),
        other => Err(RelayError::config(format!("Unknown device: {}", other))),
    }
}

fn candle_error(e: candle_core::Error) -> RelayError {
    RelayError::generation(e.to_string())
}

pub struct ModelStrategy<M: LanguageModel> {
    name: String,
    model: Mutex<M>,
    tokenizer: Tokenizer,
    device: Device,
    eos_token: Option<u32>,
    settings: SamplingSettings,
}

impl ModelStrategy<ModelWeights> {
    /// Load GGUF weights and a tokenizer
    pub fn load(name: impl Into<String>, config: &ModelConfig, device: Device) -> Result<Self> {
        let start = Instant::now();
        let weights_path = &config.weights_path;

        let mut file = std::fs::File::open(weights_path).map_err(|e| {
            RelayError::model(format!("Failed to open weights {}: {}", weights_path.display(), e))
        })?;
        let content = gguf_file::Content::read(&mut file).map_err(|e| {
            RelayError::model(format!("Failed to read GGUF {}: {}", weights_path.display(), e))
        })?;
        debug!("GGUF file has {} tensors", content.tensor_infos.len());

        let weights = ModelWeights::from_gguf(content, &mut file, &device)
            .map_err(|e| RelayError::model(format!("Failed to load weights: {}", e)))?;

        let tokenizer = Tokenizer::from_file(&config.tokenizer_path).map_err(|e| {
            RelayError::tokenizer(format!(
                "Failed to load tokenizer {}: {}",
                config.tokenizer_path.display(),
                e
            ))
        })?;

        info!("Model loaded in {:?}", start.elapsed());
        Ok(Self::new(name, weights, tokenizer, device, SamplingSettings::from(config)))
    }
}

impl<M: LanguageModel> ModelStrategy<M> {
    pub fn new(
        name: impl Into<String>,
        model: M,
        tokenizer: Tokenizer,
        device: Device,
        settings: SamplingSettings,
    ) -> Self {
        let eos_token = EOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));
        if eos_token.is_none() {
            info!("Tokenizer has no known end-of-sequence token, generation stops at max_tokens");
        }

        Self {
            name: name.into(),
            model: Mutex::new(model),
            tokenizer,
            device,
            eos_token,
            settings,
        }
    }

    pub fn eos_token(&self) -> Option<u32> {
        self.eos_token
    }

    /// Wait for the model, giving up if the stream is cancelled meanwhile
    fn lock_model(&self, sink: &TokenSink) -> Result<MutexGuard<'_, M>> {
        loop {
            if let Some(model) = self.model.try_lock_for(MODEL_LOCK_POLL) {
                return Ok(model);
            }
            if sink.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
        }
    }

    fn apply_repeat_penalty(&self, logits: Tensor, tokens: &[u32]) -> Result<Tensor> {
        if self.settings.repeat_penalty == 1.0 {
            return Ok(logits);
        }
        let start = tokens.len().saturating_sub(self.settings.repeat_last_n);
        candle_transformers::utils::apply_repeat_penalty(
            &logits,
            self.settings.repeat_penalty,
            &tokens[start..],
        )
        .map_err(candle_error)
    }

    fn next_logits(&self, model: &mut M, tokens: &[u32], index_pos: usize) -> Result<Tensor> {
        let input = Tensor::new(&tokens[index_pos..], &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(candle_error)?;

        model
            .forward(&input, index_pos)
            .and_then(|logits| logits.squeeze(0))
            .and_then(|logits| logits.to_dtype(DType::F32))
            .map_err(candle_error)
    }
}

impl<M: LanguageModel> TokenStrategy for ModelStrategy<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, request: &GenerationRequest, sink: &mut TokenSink) -> Result<()> {
        let encoding = self
            .tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(|e| RelayError::tokenizer(format!("Failed to encode prompt: {}", e)))?;
        let mut tokens = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            return Err(RelayError::generation("prompt produced no tokens"));
        }

        let mode = request.decoding_mode();
        debug!(
            "Generating for {}: {} prompt tokens, max {} new, {:?}",
            request.request_id,
            tokens.len(),
            request.max_tokens,
            mode
        );

        let mut logits_processor = LogitsProcessor::from_sampling(self.settings.seed, self.settings.sampling(mode));
        let mut decoder = IncrementalDecoder::new(&self.tokenizer);
        let mut model = self.lock_model(sink)?;

        for index in 0..request.max_tokens {
            if sink.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            // The whole prompt on the first step, then one token at a time
            let index_pos = if index == 0 { 0 } else { tokens.len() - 1 };
            let logits = self.next_logits(&mut model, &tokens, index_pos)?;
            let logits = self.apply_repeat_penalty(logits, &tokens)?;
            let next = logits_processor.sample(&logits).map_err(candle_error)?;

            if Some(next) == self.eos_token {
                debug!("End of sequence after {} tokens", index);
                break;
            }
            tokens.push(next);

            if let Some(fragment) = decoder.push(next)? {
                sink.push(fragment)?;
            }
        }
        drop(model);

        if let Some(rest) = decoder.flush()? {
            if !sink.is_exhausted() {
                sink.push(rest)?;
            }
        }
        Ok(())
    }
}
