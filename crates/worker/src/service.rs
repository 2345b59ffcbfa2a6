//! Streaming generation service
//!
//! Implements the `ModelService` gRPC surface. `Generate` validates a request,
//! claims its id in the in-flight registry and returns a `GenerationStream`
//! that owns the compute bridge for the request. tonic polls that stream and
//! drops it when the client goes away, which tears the bridge down.
//!
//! Prompt validation is done here rather than trusted to the gateway: a
//! request that reaches this worker with an empty prompt is rejected with
//! `INVALID_ARGUMENT` before any stream opens.

use crate::bridge::{ComputeBridge, ComputeContexts};
use crate::request::{GenerationRequest, TokenEvent};
use crate::strategy::TokenStrategy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tokenrelay_common::{MetricsRegistry, RelayError, Result};
use tokenrelay_proto::{
    GenerateRequest, HealthRequest, HealthResponse, ModelService, TokenResponse,
};
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Request ids with an open stream
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `request_id` until the returned guard is dropped
    pub fn register(&self, request_id: &str) -> Result<InFlightGuard> {
        let mut active = self.active.lock();
        if !active.insert(request_id.to_string()) {
            return Err(RelayError::AlreadyActive(request_id.to_string()));
        }

        Ok(InFlightGuard {
            request_id: request_id.to_string(),
            active: self.active.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.active.lock().contains(request_id)
    }
}

/// Releases a request id when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    request_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.request_id);
    }
}

/// Lifecycle of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Bridge spawned, nothing delivered yet
    Pending,

    /// At least one token delivered
    Streaming,

    /// Finished event delivered
    Completed,

    /// Error event delivered
    Failed,

    /// Dropped by the client before a terminal event
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

/// Token stream for one request
///
/// Yields events in production order and ends right after the terminal
/// event. Dropping it before then cancels the request.
#[derive(Debug)]
pub struct GenerationStream {
    request_id: String,
    bridge: ComputeBridge,
    state: StreamState,
    delivered: u32,
    started: Instant,
    metrics: MetricsRegistry,
    _in_flight: InFlightGuard,
}

impl GenerationStream {
    pub fn state(&self) -> StreamState {
        self.state
    }

    fn observe(&mut self, event: &TokenEvent) {
        let metrics = &self.metrics.generate;
        match event {
            TokenEvent::Token { token_count, .. } => {
                if self.state == StreamState::Pending {
                    metrics
                        .time_to_first_token
                        .observe(self.started.elapsed().as_secs_f64());
                    self.state = StreamState::Streaming;
                }
                self.delivered = *token_count;
                metrics.tokens_total.inc();
            }
            TokenEvent::Finished { token_count } => {
                self.state = StreamState::Completed;
                metrics.requests_completed.inc();
                metrics
                    .request_duration
                    .observe(self.started.elapsed().as_secs_f64());
                info!(
                    "Finished request {} ({} tokens in {:?})",
                    self.request_id,
                    token_count,
                    self.started.elapsed()
                );
            }
            TokenEvent::Failed { message, .. } => {
                self.state = StreamState::Failed;
                metrics.requests_failed.inc();
                metrics
                    .request_duration
                    .observe(self.started.elapsed().as_secs_f64());
                warn!("Request {} failed: {}", self.request_id, message);
            }
        }
    }
}

impl Stream for GenerationStream {
    type Item = std::result::Result<TokenResponse, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state.is_terminal() {
            return Poll::Ready(None);
        }

        let event = match ready!(this.bridge.poll_recv(cx)) {
            Some(event) => event,
            // The bridge always sends a terminal event unless it was
            // cancelled, so this only happens if its compute context died.
            None => TokenEvent::Failed {
                message: "compute context exited without a terminal event".to_string(),
                token_count: this.delivered,
            },
        };

        this.observe(&event);
        Poll::Ready(Some(Ok(event.into_response(&this.request_id))))
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.state = StreamState::Cancelled;
            self.metrics.generate.requests_cancelled.inc();
            info!(
                "Request {} cancelled after {} tokens",
                self.request_id, self.delivered
            );
        }
        self.metrics.generate.active_streams.dec();
        self.bridge.cancel();
    }
}

struct ServiceInner {
    strategy: Arc<dyn TokenStrategy>,
    in_flight: InFlightRegistry,
    contexts: ComputeContexts,
    channel_capacity: usize,
    metrics: MetricsRegistry,
}

/// The `ModelService` implementation
#[derive(Clone)]
pub struct GenerationService {
    inner: Arc<ServiceInner>,
}

impl GenerationService {
    pub fn new(
        strategy: Arc<dyn TokenStrategy>,
        channel_capacity: usize,
        metrics: MetricsRegistry,
    ) -> Self {
        let contexts = ComputeContexts::new(metrics.generate.compute_contexts.clone());
        Self {
            inner: Arc::new(ServiceInner {
                strategy,
                in_flight: InFlightRegistry::new(),
                contexts,
                channel_capacity,
                metrics,
            }),
        }
    }

    /// Validate a request and start streaming it
    pub fn open_stream(&self, request: GenerationRequest) -> Result<GenerationStream> {
        request.validate()?;
        let guard = self.inner.in_flight.register(&request.request_id)?;

        info!(
            "Received request {}: model={:?}, max_tokens={}, priority={}, prompt={:?}",
            request.request_id,
            request.model,
            request.max_tokens,
            request.priority,
            request.prompt.chars().take(50).collect::<String>()
        );

        let request_id = request.request_id.clone();
        let bridge = ComputeBridge::spawn(
            request,
            self.inner.strategy.clone(),
            self.inner.contexts.clone(),
            self.inner.channel_capacity,
        );
        self.inner.metrics.generate.active_streams.inc();

        Ok(GenerationStream {
            request_id,
            bridge,
            state: StreamState::Pending,
            delivered: 0,
            started: Instant::now(),
            metrics: self.inner.metrics.clone(),
            _in_flight: guard,
        })
    }

    /// Current health; never waits on a stream
    pub fn health_status(&self) -> HealthResponse {
        HealthResponse {
            healthy: true,
            current_queue_size: i32::try_from(self.inner.in_flight.len()).unwrap_or(i32::MAX),
            gpu_utilization: self.inner.strategy.gpu_utilization(),
        }
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.inner.in_flight
    }

    /// Compute contexts still running a strategy
    pub fn active_compute_contexts(&self) -> usize {
        self.inner.contexts.live()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }
}

#[tonic::async_trait]
impl ModelService for GenerationService {
    type GenerateStream = GenerationStream;

    async fn generate(
        &self,
        request: Request<GenerateRequest>,
    ) -> std::result::Result<Response<Self::GenerateStream>, Status> {
        self.inner.metrics.generate.requests_total.inc();

        let stream = GenerationRequest::try_from(request.into_inner())
            .and_then(|request| self.open_stream(request))
            .map_err(|e| {
                self.inner.metrics.generate.requests_rejected.inc();
                debug!("Rejected generate request: {}", e);
                e.to_status()
            })?;

        Ok(Response::new(stream))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> std::result::Result<Response<HealthResponse>, Status> {
        self.inner.metrics.health_checks.inc();
        Ok(Response::new(self.health_status()))
    }
}
