//! Configuration structures for TokenRelay
//!
//! The worker is configured once at startup. Configuration is loaded from a
//! YAML (or JSON) file, or assembled from `TOKENRELAY_*` environment variables
//! when no file is given.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Which compute strategy serves requests
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Name reported by the strategy (echo tag, model label)
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Artificial per-token latency in milliseconds (echo strategy only)
    #[serde(default)]
    pub latency_ms: u64,

    /// Compute device: "cpu", "cuda", "cuda:N" or "metal"
    #[serde(default = "default_device")]
    pub device: String,

    /// Stream plumbing
    #[serde(default)]
    pub stream: StreamConfig,

    /// Model strategy configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Compute strategy selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Deterministic prompt echo, for tests and load generation
    #[default]
    Echo,

    /// Real sequence model
    Model,
}

impl std::str::FromStr for StrategyKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "echo" | "mock" => Ok(StrategyKind::Echo),
            "model" => Ok(StrategyKind::Model),
            other => Err(RelayError::config(format!("Unknown strategy: {}", other))),
        }
    }
}

/// Stream plumbing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Capacity of the bounded channel between a strategy and its stream
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Model strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// GGUF weights file
    pub weights_path: PathBuf,

    /// tokenizer.json file
    pub tokenizer_path: PathBuf,

    /// Sampling seed
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Nucleus sampling threshold, applied only when sampling
    pub top_p: Option<f64>,

    /// Repetition penalty (1.0 disables it)
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Number of trailing tokens the repetition penalty looks at
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    50051
}

fn default_model_name() -> String {
    "mock-gpt".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_channel_capacity() -> usize {
    32
}

fn default_seed() -> u64 {
    299792458
}

fn default_repeat_penalty() -> f32 {
    1.0
}

fn default_repeat_last_n() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            strategy: StrategyKind::default(),
            model_name: default_model_name(),
            latency_ms: 0,
            device: default_device(),
            stream: StreamConfig::default(),
            model: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file, or JSON when the extension is `.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        let config: RelayConfig = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RelayConfig::default();

        if let Some(addr) = lookup("TOKENRELAY_BIND_ADDRESS") {
            config.bind_address = addr;
        }
        if let Some(port) = lookup("TOKENRELAY_PORT") {
            config.port = port
                .parse()
                .map_err(|_| RelayError::config(format!("Invalid port number: {}", port)))?;
        }
        if let Some(strategy) = lookup("TOKENRELAY_STRATEGY") {
            config.strategy = strategy.parse()?;
        }
        if let Some(name) = lookup("TOKENRELAY_MODEL_NAME") {
            config.model_name = name;
        }
        if let Some(latency) = lookup("TOKENRELAY_LATENCY_MS") {
            config.latency_ms = latency
                .parse()
                .map_err(|_| RelayError::config(format!("Invalid latency: {}", latency)))?;
        }
        if let Some(device) = lookup("TOKENRELAY_DEVICE") {
            config.device = device;
        }

        let weights = lookup("TOKENRELAY_WEIGHTS_PATH");
        let tokenizer = lookup("TOKENRELAY_TOKENIZER_PATH");
        if let (Some(weights_path), Some(tokenizer_path)) = (weights, tokenizer) {
            config.model = Some(ModelConfig {
                weights_path: PathBuf::from(weights_path),
                tokenizer_path: PathBuf::from(tokenizer_path),
                seed: default_seed(),
                top_p: None,
                repeat_penalty: default_repeat_penalty(),
                repeat_last_n: default_repeat_last_n(),
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(RelayError::config("Port must be non-zero"));
        }

        if self.stream.channel_capacity == 0 {
            return Err(RelayError::config("stream.channel_capacity must be at least 1"));
        }

        if self.strategy == StrategyKind::Model {
            let model = self
                .model
                .as_ref()
                .ok_or_else(|| RelayError::config("Model config required for model strategy"))?;

            if !(model.repeat_penalty > 0.0) {
                return Err(RelayError::config(format!(
                    "repeat_penalty must be positive, got {}",
                    model.repeat_penalty
                )));
            }

            if let Some(p) = model.top_p {
                if !(p > 0.0 && p <= 1.0) {
                    return Err(RelayError::config(format!("top_p must be in (0, 1], got {}", p)));
                }
            }
        }

        Ok(())
    }

    /// Get the listen address as "host:port"
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Get the per-token latency as Duration
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}
