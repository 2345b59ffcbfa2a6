//! Worker gRPC client
//!
//! Thin wrapper over the generated `ModelServiceClient`, used by the
//! integration tests and by anything that needs to drive a worker directly.

use tokenrelay_common::{RelayError, Result};
use tokenrelay_proto::{
    GenerateRequest, HealthRequest, HealthResponse, ModelServiceClient, TokenResponse,
};
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::debug;
use uuid::Uuid;

/// gRPC client for a worker
#[derive(Clone)]
pub struct WorkerClient {
    endpoint: String,
    inner: ModelServiceClient<Channel>,
}

impl WorkerClient {
    /// Connect to a worker endpoint such as `http://127.0.0.1:50051`
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let inner = ModelServiceClient::connect(endpoint.clone()).await?;
        debug!("Connected to worker at {}", endpoint);
        Ok(Self { endpoint, inner })
    }

    /// Open a token stream
    ///
    /// A random request id is assigned if the request has none.
    pub async fn generate(&self, mut request: GenerateRequest) -> Result<Streaming<TokenResponse>> {
        if request.request_id.is_empty() {
            request.request_id = Uuid::new_v4().to_string();
        }

        debug!("Opening stream {} on {}", request.request_id, self.endpoint);
        let response = self.inner.clone().generate(request).await?;
        Ok(response.into_inner())
    }

    /// Run a request to completion and return every event, terminal included
    pub async fn generate_all(&self, request: GenerateRequest) -> Result<Vec<TokenResponse>> {
        let mut stream = self.generate(request).await?;
        let mut events = Vec::new();

        while let Some(event) = stream.message().await? {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return Ok(events);
            }
        }

        Err(RelayError::generation(format!(
            "stream ended after {} events without a terminal event",
            events.len()
        )))
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.inner.clone().health(HealthRequest {}).await?;
        Ok(response.into_inner())
    }
}
