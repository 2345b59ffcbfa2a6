//! Common error types for TokenRelay
//!
//! Every error the worker can produce is a `RelayError`. Errors raised before
//! a stream opens are turned into a gRPC status with [`RelayError::to_status`];
//! errors raised mid-stream become the message of the terminal error event.

use thiserror::Error;

/// Main error type for TokenRelay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC errors returned by a remote worker
    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed request, rejected before a stream is opened
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stream with the same request id is already in flight
    #[error("Request already active: {0}")]
    AlreadyActive(String),

    /// The compute strategy failed while producing tokens
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The consumer went away; the producer must stop
    #[error("Stream cancelled")]
    Cancelled,

    /// Model, weights or device could not be loaded
    #[error("Model error: {0}")]
    Model(String),

    /// Tokenizer loading, encoding or decoding errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

impl RelayError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        match self {
            RelayError::Rpc(status) => status.clone(),
            RelayError::InvalidInput(msg) => {
                tonic::Status::invalid_argument(format!("Invalid input: {}", msg))
            }
            RelayError::AlreadyActive(id) => {
                tonic::Status::already_exists(format!("Request {} is already streaming", id))
            }
            RelayError::Cancelled => tonic::Status::cancelled("Stream cancelled"),
            RelayError::Transport(_) => tonic::Status::unavailable("Transport error"),
            RelayError::Config(msg) => {
                tonic::Status::internal(format!("Configuration error: {}", msg))
            }
            RelayError::Model(msg) => {
                tonic::Status::failed_precondition(format!("Model error: {}", msg))
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        RelayError::InvalidInput(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        RelayError::Generation(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        RelayError::Model(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        RelayError::Tokenizer(msg.into())
    }

    /// Whether the error was caused by the consumer disconnecting
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }
}

/// Result type alias for TokenRelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
