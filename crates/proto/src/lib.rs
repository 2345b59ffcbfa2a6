//! TokenRelay Protocol Buffers
//!
//! Wire messages for the `inference.ModelService` gRPC service. The message
//! structs are written by hand with `prost` derives and mirror
//! `inference.proto` tag for tag; the client and server stubs are generated
//! by `build.rs`.

/// A single generation request, as sent by the gateway.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GenerateRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,

    #[prost(string, tag = "2")]
    pub model: String,

    #[prost(string, tag = "3")]
    pub prompt: String,

    #[prost(int32, tag = "4")]
    pub max_tokens: i32,

    #[prost(float, tag = "5")]
    pub temperature: f32,

    /// Gateway queue priority; informational only
    #[prost(int32, tag = "6")]
    pub priority: i32,
}

/// One streamed event. Either a token fragment or the terminal marker.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TokenResponse {
    #[prost(string, tag = "1")]
    pub request_id: String,

    #[prost(string, tag = "2")]
    pub token: String,

    /// Cumulative number of token fragments emitted so far
    #[prost(int32, tag = "3")]
    pub token_count: i32,

    #[prost(bool, tag = "4")]
    pub finished: bool,

    #[prost(string, optional, tag = "5")]
    pub error: Option<String>,
}

impl TokenResponse {
    /// Whether this event closes the stream
    pub fn is_terminal(&self) -> bool {
        self.finished || self.error.is_some()
    }
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct HealthRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct HealthResponse {
    #[prost(bool, tag = "1")]
    pub healthy: bool,

    #[prost(int32, tag = "2")]
    pub current_queue_size: i32,

    #[prost(float, tag = "3")]
    pub gpu_utilization: f32,
}

include!(concat!(env!("OUT_DIR"), "/inference.ModelService.rs"));

pub use model_service_client::ModelServiceClient;
pub use model_service_server::{ModelService, ModelServiceServer};
