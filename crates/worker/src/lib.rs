//! TokenRelay Worker
//!
//! Streaming inference worker. Each `Generate` call runs a compute strategy
//! on a blocking thread and relays its tokens to the client through a
//! bounded channel, ending every stream with exactly one terminal event.

pub mod bridge;
pub mod grpc;
pub mod latency;
pub mod request;
pub mod service;
pub mod strategy;

pub use bridge::{ComputeBridge, ComputeContexts, TokenSink};
pub use grpc::{WorkerClient, WorkerServer};
pub use latency::LatencyInjector;
pub use request::{DecodingMode, GenerationRequest, TokenEvent};
pub use service::{GenerationService, GenerationStream, InFlightRegistry, StreamState};
pub use strategy::{EchoStrategy, ModelStrategy, TokenStrategy};
