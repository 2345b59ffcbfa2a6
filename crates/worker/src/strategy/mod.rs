//! Compute strategies
//!
//! A strategy turns one request into an ordered sequence of text fragments,
//! written into a `TokenSink`. Strategies run on a blocking compute context
//! and may block freely. The bridge and the service only ever see
//! `dyn TokenStrategy`, so any implementation can serve the same wire
//! contract.

pub mod decoder;
pub mod echo;
pub mod model;

pub use decoder::IncrementalDecoder;
pub use echo::EchoStrategy;
pub use model::{parse_device, LanguageModel, ModelStrategy, SamplingSettings};

use crate::bridge::TokenSink;
use crate::latency::LatencyInjector;
use crate::request::GenerationRequest;
use std::sync::Arc;
use tokenrelay_common::config::{RelayConfig, StrategyKind};
use tokenrelay_common::{RelayError, Result};
use tracing::info;

/// Produces the token stream for a request
pub trait TokenStrategy: Send + Sync + 'static {
    /// Name reported in logs
    fn name(&self) -> &str;

    /// Produce fragments for `request` into `sink`, in order
    ///
    /// Returns once generation is complete. The sink enforces the token
    /// budget; a push error must be propagated so the strategy stops as soon
    /// as its stream is cancelled.
    fn generate(&self, request: &GenerationRequest, sink: &mut TokenSink) -> Result<()>;

    /// Accelerator utilization in [0, 1], informational
    fn gpu_utilization(&self) -> f32 {
        0.0
    }
}

/// Build the strategy selected by the configuration
///
/// Fails if the model strategy cannot load its weights, tokenizer or device.
pub fn from_config(config: &RelayConfig) -> Result<Arc<dyn TokenStrategy>> {
    match config.strategy {
        StrategyKind::Echo => {
            info!(
                "Using echo strategy: model={}, latency={:?}",
                config.model_name,
                config.latency()
            );
            Ok(Arc::new(EchoStrategy::new(
                config.model_name.clone(),
                LatencyInjector::new(config.latency()),
            )))
        }
        StrategyKind::Model => {
            let model_config = config
                .model
                .as_ref()
                .ok_or_else(|| RelayError::config("Model config required for model strategy"))?;
            let device = parse_device(&config.device)?;

            info!(
                "Loading model {} from {} on {}",
                config.model_name,
                model_config.weights_path.display(),
                config.device
            );
            let strategy = ModelStrategy::load(config.model_name.clone(), model_config, device)?;
            Ok(Arc::new(strategy))
        }
    }
}
