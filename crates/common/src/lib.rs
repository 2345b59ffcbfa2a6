//! TokenRelay common library
//!
//! This crate contains configuration, error and metrics code shared by the
//! worker binary and its library.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
