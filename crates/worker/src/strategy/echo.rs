//! Deterministic echo strategy
//!
//! Echoes the prompt back word by word behind a tag naming the simulated
//! model. Used by integration tests and load generation in place of a real
//! model.

use super::TokenStrategy;
use crate::bridge::TokenSink;
use crate::latency::LatencyInjector;
use crate::request::GenerationRequest;
use tokenrelay_common::Result;

/// Words allowed past the prompt length before the cap applies
const EXTRA_TOKEN_ALLOWANCE: usize = 5;

pub struct EchoStrategy {
    model_name: String,
    latency: LatencyInjector,
}

impl EchoStrategy {
    pub fn new(model_name: impl Into<String>, latency: LatencyInjector) -> Self {
        Self {
            model_name: model_name.into(),
            latency,
        }
    }

    /// The fragments this strategy produces for `request`
    ///
    /// One tag token, then at most `min(max_tokens, words + 5) - 1` words,
    /// each followed by a space.
    pub fn fragments(&self, request: &GenerationRequest) -> Vec<String> {
        let words: Vec<&str> = request.prompt.split_whitespace().collect();
        let cap = request.max_tokens.min(words.len() + EXTRA_TOKEN_ALLOWANCE);

        std::iter::once(format!("[{}] ", self.model_name))
            .chain(
                words
                    .iter()
                    .take(cap.saturating_sub(1))
                    .map(|word| format!("{} ", word)),
            )
            .take(cap)
            .collect()
    }
}

impl TokenStrategy for EchoStrategy {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn generate(&self, request: &GenerationRequest, sink: &mut TokenSink) -> Result<()> {
        for fragment in self.fragments(request) {
            self.latency.pause();
            sink.push(fragment)?;
        }
        Ok(())
    }
}
