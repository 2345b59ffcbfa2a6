//! Generation requests and token events
//!
//! `GenerationRequest` is the worker-side view of a `GenerateRequest` off
//! the wire. `TokenEvent` is what a compute bridge hands
//! to its stream; every event maps onto exactly one `TokenResponse`.

use tokenrelay_common::{RelayError, Result};
use tokenrelay_proto::{GenerateRequest, TokenResponse};

/// Temperatures below this select greedy decoding
pub const GREEDY_TEMPERATURE_EPSILON: f32 = 1e-5;

/// Token selection mode, resolved once per request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodingMode {
    /// Always take the most likely next token
    Greedy,

    /// Sample from the temperature-scaled distribution
    Sampling { temperature: f64 },
}

impl DecodingMode {
    /// Resolve the decoding mode for a request temperature
    pub fn from_temperature(temperature: f32) -> Self {
        if temperature < GREEDY_TEMPERATURE_EPSILON {
            DecodingMode::Greedy
        } else {
            DecodingMode::Sampling {
                temperature: f64::from(temperature),
            }
        }
    }
}

/// A generation request; `validate` checks it before a stream opens
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Unique per in-flight stream
    pub request_id: String,

    pub prompt: String,

    /// Upper bound on non-terminal events
    pub max_tokens: usize,

    pub temperature: f32,

    /// Opaque model selector
    pub model: String,

    /// Gateway queue priority, informational
    pub priority: i32,
}

impl GenerationRequest {
    /// Create a greedy request with no model selector
    pub fn new(request_id: impl Into<String>, prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            max_tokens,
            temperature: 0.0,
            model: String::new(),
            priority: 0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Check the request against the worker's preconditions
    ///
    /// The same malformed request is always rejected with the same error.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.is_empty() {
            return Err(RelayError::invalid_input("request_id must not be empty"));
        }
        if self.prompt.is_empty() {
            return Err(RelayError::invalid_input("prompt must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(RelayError::invalid_input("max_tokens must be positive"));
        }
        if self.max_tokens > i32::MAX as usize {
            return Err(RelayError::invalid_input("max_tokens is too large"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(RelayError::invalid_input(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn decoding_mode(&self) -> DecodingMode {
        DecodingMode::from_temperature(self.temperature)
    }
}

impl TryFrom<GenerateRequest> for GenerationRequest {
    type Error = RelayError;

    fn try_from(wire: GenerateRequest) -> Result<Self> {
        let max_tokens = usize::try_from(wire.max_tokens)
            .map_err(|_| RelayError::invalid_input("max_tokens must be positive"))?;

        Ok(GenerationRequest {
            request_id: wire.request_id,
            prompt: wire.prompt,
            max_tokens,
            temperature: wire.temperature,
            model: wire.model,
            priority: wire.priority,
        })
    }
}

/// One item on a compute bridge's channel
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// A produced text fragment; `token_count` includes it
    Token { text: String, token_count: u32 },

    /// The strategy returned normally
    Finished { token_count: u32 },

    /// The strategy failed; no tokens follow
    Failed { message: String, token_count: u32 },
}

impl TokenEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenEvent::Token { .. })
    }

    pub fn token_count(&self) -> u32 {
        match self {
            TokenEvent::Token { token_count, .. }
            | TokenEvent::Finished { token_count }
            | TokenEvent::Failed { token_count, .. } => *token_count,
        }
    }

    /// Build the wire message for this event
    pub fn into_response(self, request_id: &str) -> TokenResponse {
        let token_count = i32::try_from(self.token_count()).unwrap_or(i32::MAX);
        let request_id = request_id.to_string();

        match self {
            TokenEvent::Token { text, .. } => TokenResponse {
                request_id,
                token: text,
                token_count,
                finished: false,
                error: None,
            },
            TokenEvent::Finished { .. } => TokenResponse {
                request_id,
                token: String::new(),
                token_count,
                finished: true,
                error: None,
            },
            TokenEvent::Failed { message, .. } => TokenResponse {
                request_id,
                token: String::new(),
                token_count,
                finished: false,
                error: Some(message),
            },
        }
    }
}
