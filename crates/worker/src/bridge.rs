//! Compute bridge between a blocking strategy and an async stream
//!
//! A `ComputeBridge` runs one strategy for one request on a blocking thread
//! from tokio's blocking pool. The strategy writes into a `TokenSink`, the
//! producer half of a bounded channel; the stream polls the receiver half.
//! A full channel parks the compute thread, never the dispatcher.
//!
//! The bridge, not the strategy, writes the terminal event. It is sent once,
//! after the strategy has returned and the sink is consumed, so no token can
//! follow it. If the receiver is gone the terminal event is skipped.
//!
//! Dropping the bridge cancels it: the cancel flag is raised, the receiver is
//! closed and the next `TokenSink::push` fails with `RelayError::Cancelled`.
//! A forward pass that is already running cannot be interrupted; its output
//! is discarded once it returns.

use crate::request::{GenerationRequest, TokenEvent};
use crate::strategy::TokenStrategy;
use prometheus::IntGauge;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokenrelay_common::{RelayError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Producer half of a bridge channel, handed to the strategy
///
/// Numbers every fragment and refuses to go past the request's token budget.
pub struct TokenSink {
    tx: mpsc::Sender<TokenEvent>,
    cancelled: Arc<AtomicBool>,
    emitted: u32,
    limit: u32,
}

impl TokenSink {
    pub(crate) fn new(tx: mpsc::Sender<TokenEvent>, cancelled: Arc<AtomicBool>, limit: usize) -> Self {
        Self {
            tx,
            cancelled,
            emitted: 0,
            limit: u32::try_from(limit).unwrap_or(u32::MAX),
        }
    }

    /// Send one fragment, blocking while the channel is full
    ///
    /// Fails with `RelayError::Cancelled` once the stream is gone. Must only
    /// be called from a blocking context.
    pub fn push(&mut self, text: impl Into<String>) -> Result<()> {
        if self.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        if self.is_exhausted() {
            return Err(RelayError::generation(format!(
                "strategy produced more than {} tokens",
                self.limit
            )));
        }

        let token_count = self.emitted + 1;
        self.tx
            .blocking_send(TokenEvent::Token {
                text: text.into(),
                token_count,
            })
            .map_err(|_| RelayError::Cancelled)?;

        self.emitted = token_count;
        trace!("Pushed token {}/{}", token_count, self.limit);
        Ok(())
    }

    /// Fragments accepted so far
    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    pub fn is_exhausted(&self) -> bool {
        self.emitted >= self.limit
    }

    /// Whether the consuming stream has gone away
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Write the terminal event for a strategy outcome
    fn finish(self, outcome: Result<()>) {
        let terminal = match outcome {
            Ok(()) => TokenEvent::Finished {
                token_count: self.emitted,
            },
            Err(_) if self.is_cancelled() => {
                debug!("Strategy stopped after cancellation ({} tokens)", self.emitted);
                return;
            }
            Err(e) => TokenEvent::Failed {
                message: e.to_string(),
                token_count: self.emitted,
            },
        };

        if self.tx.blocking_send(terminal).is_err() {
            debug!("Stream closed before terminal event");
        }
    }
}

/// Live compute-context counter shared by every bridge of a service
#[derive(Debug, Clone)]
pub struct ComputeContexts {
    live: Arc<AtomicUsize>,
    gauge: IntGauge,
}

impl ComputeContexts {
    pub fn new(gauge: IntGauge) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            gauge,
        }
    }

    /// Number of compute contexts currently running a strategy
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn enter(&self) -> ContextGuard {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.gauge.inc();
        ContextGuard {
            contexts: self.clone(),
        }
    }
}

/// Marks one running compute context; released when the strategy returns or unwinds
struct ContextGuard {
    contexts: ComputeContexts,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.contexts.live.fetch_sub(1, Ordering::AcqRel);
        self.contexts.gauge.dec();
    }
}

/// Runs one strategy for one request and relays its tokens
#[derive(Debug)]
pub struct ComputeBridge {
    request_id: String,
    rx: mpsc::Receiver<TokenEvent>,
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ComputeBridge {
    /// Start the strategy on a blocking thread
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        request: GenerationRequest,
        strategy: Arc<dyn TokenStrategy>,
        contexts: ComputeContexts,
        channel_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let request_id = request.request_id.clone();

        let sink = TokenSink::new(tx, cancelled.clone(), request.max_tokens);
        let task = tokio::task::spawn_blocking(move || {
            let _context = contexts.enter();
            run_strategy(strategy.as_ref(), &request, sink);
        });

        debug!("Compute bridge started for {}", request_id);

        Self {
            request_id,
            rx,
            cancelled,
            task: Some(task),
        }
    }

    /// Receive the next event in production order
    pub async fn recv(&mut self) -> Option<TokenEvent> {
        self.rx.recv().await
    }

    /// Poll for the next event in production order
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TokenEvent>> {
        self.rx.poll_recv(cx)
    }

    /// Stop relaying and let the compute context wind down
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.rx.close();

        // Drain anything already queued so a producer parked on a full
        // channel wakes up and sees the closed receiver.
        while self.rx.try_recv().is_ok() {}

        if let Some(task) = self.task.take() {
            reap(self.request_id.clone(), task);
        }
    }
}

impl Drop for ComputeBridge {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_strategy(strategy: &dyn TokenStrategy, request: &GenerationRequest, mut sink: TokenSink) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| strategy.generate(request, &mut sink)))
        .unwrap_or_else(|payload| {
            warn!(
                "Strategy {} panicked on {}",
                strategy.name(),
                request.request_id
            );
            Err(RelayError::generation(panic_message(payload.as_ref())))
        });

    if let Err(e) = &outcome {
        if !e.is_cancelled() {
            warn!("Generation failed for {}: {}", request.request_id, e);
        }
    }

    sink.finish(outcome);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("strategy panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("strategy panicked: {}", msg)
    } else {
        "strategy panicked".to_string()
    }
}

/// Join a compute context in the background and log how it ended
fn reap(request_id: String, task: JoinHandle<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match task.await {
                    Ok(()) => debug!("Compute context for {} reclaimed", request_id),
                    Err(e) => warn!("Compute context for {} ended abnormally: {}", request_id, e),
                }
            });
        }
        Err(_) => debug!("No runtime to join compute context for {}", request_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::EchoStrategy;
    use crate::LatencyInjector;
    use std::time::Duration;

    fn contexts() -> ComputeContexts {
        ComputeContexts::new(IntGauge::new("test_compute_contexts", "test").unwrap())
    }

    struct FailingStrategy {
        after: usize,
    }

    impl TokenStrategy for FailingStrategy {
        fn name(&self) -> &str {
            "failing"
        }

        fn generate(&self, _request: &GenerationRequest, sink: &mut TokenSink) -> Result<()> {
            for i in 0..self.after {
                sink.push(format!("t{} ", i))?;
            }
            Err(RelayError::generation("decode failed"))
        }
    }

    struct PanickingStrategy;

    impl TokenStrategy for PanickingStrategy {
        fn name(&self) -> &str {
            "panicking"
        }

        fn generate(&self, _request: &GenerationRequest, sink: &mut TokenSink) -> Result<()> {
            sink.push("first ")?;
            panic!("weights corrupted");
        }
    }

    struct GreedyStrategy;

    impl TokenStrategy for GreedyStrategy {
        fn name(&self) -> &str {
            "greedy"
        }

        fn generate(&self, _request: &GenerationRequest, sink: &mut TokenSink) -> Result<()> {
            loop {
                sink.push("more ")?;
            }
        }
    }

    /// Counts fragments the channel has accepted
    struct CountingStrategy {
        pushed: Arc<AtomicUsize>,
    }

    impl TokenStrategy for CountingStrategy {
        fn name(&self) -> &str {
            "counting"
        }

        fn generate(&self, _request: &GenerationRequest, sink: &mut TokenSink) -> Result<()> {
            loop {
                sink.push("tick ")?;
                self.pushed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn drain(bridge: &mut ComputeBridge) -> Vec<TokenEvent> {
        let mut events = Vec::new();
        while let Some(event) = bridge.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_echo_through_bridge() {
        let strategy = Arc::new(EchoStrategy::new("gpt-small", LatencyInjector::disabled()));
        let request = GenerationRequest::new("req-1", "hello world", 5);
        let mut bridge = ComputeBridge::spawn(request, strategy, contexts(), 4);

        let events = drain(&mut bridge).await;
        assert_eq!(
            events,
            vec![
                TokenEvent::Token { text: "[gpt-small] ".into(), token_count: 1 },
                TokenEvent::Token { text: "hello ".into(), token_count: 2 },
                TokenEvent::Token { text: "world ".into(), token_count: 3 },
                TokenEvent::Finished { token_count: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_emits_single_error_terminal() {
        let request = GenerationRequest::new("req-err", "x", 10);
        let mut bridge = ComputeBridge::spawn(request, Arc::new(FailingStrategy { after: 2 }), contexts(), 4);

        let events = drain(&mut bridge).await;
        assert_eq!(events.len(), 3);
        assert!(events[..2].iter().all(|e| !e.is_terminal()));
        match &events[2] {
            TokenEvent::Failed { message, token_count } => {
                assert!(message.contains("decode failed"));
                assert_eq!(*token_count, 2);
            }
            other => panic!("expected failure terminal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error_terminal() {
        let request = GenerationRequest::new("req-panic", "x", 10);
        let contexts = contexts();
        let mut bridge = ComputeBridge::spawn(request, Arc::new(PanickingStrategy), contexts.clone(), 4);

        let events = drain(&mut bridge).await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            TokenEvent::Failed { message, .. } => assert!(message.contains("weights corrupted")),
            other => panic!("expected failure terminal, got {:?}", other),
        }
        assert_eq!(contexts.live(), 0);
    }

    #[tokio::test]
    async fn test_budget_overrun_is_a_failure() {
        let request = GenerationRequest::new("req-greedy", "x", 3);
        let mut bridge = ComputeBridge::spawn(request, Arc::new(GreedyStrategy), contexts(), 8);

        let events = drain(&mut bridge).await;
        let tokens = events.iter().filter(|e| !e.is_terminal()).count();
        assert_eq!(tokens, 3);
        assert!(matches!(events.last(), Some(TokenEvent::Failed { token_count: 3, .. })));
    }

    #[tokio::test]
    async fn test_cancel_reclaims_blocked_producer() {
        let contexts = contexts();
        let request = GenerationRequest::new("req-cancel", "x", 1_000_000);
        // Capacity 1 keeps the producer parked on a full channel
        let mut bridge = ComputeBridge::spawn(request, Arc::new(GreedyStrategy), contexts.clone(), 1);

        assert!(matches!(bridge.recv().await, Some(TokenEvent::Token { token_count: 1, .. })));
        drop(bridge);

        tokio::time::timeout(Duration::from_secs(5), async {
            while contexts.live() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("compute context was not reclaimed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_channel_parks_producer() {
        let pushed = Arc::new(AtomicUsize::new(0));
        let strategy = Arc::new(CountingStrategy {
            pushed: pushed.clone(),
        });
        let request = GenerationRequest::new("req-slow", "x", 1_000);
        let mut bridge = ComputeBridge::spawn(request, strategy, contexts(), 2);

        // Nobody reads, so the producer stops once the channel is full
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pushed.load(Ordering::SeqCst), 2);

        // Each event taken frees exactly one slot
        assert!(matches!(bridge.recv().await, Some(TokenEvent::Token { token_count: 1, .. })));
        tokio::time::timeout(Duration::from_secs(5), async {
            while pushed.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("producer did not resume");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pushed.load(Ordering::SeqCst), 3);
    }
}
