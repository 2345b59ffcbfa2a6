//! End-to-end streaming tests over a loopback gRPC server

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokenrelay_common::{MetricsRegistry, RelayError, Result};
use tokenrelay_proto::{GenerateRequest, TokenResponse};
use tokenrelay_worker::{
    EchoStrategy, GenerationRequest, GenerationService, LatencyInjector, TokenSink,
    TokenStrategy, WorkerClient, WorkerServer,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::Code;

struct TestWorker {
    client: WorkerClient,
    service: GenerationService,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn start_worker(strategy: Arc<dyn TokenStrategy>) -> TestWorker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = GenerationService::new(strategy, 4, MetricsRegistry::new());
    let (shutdown, signal) = oneshot::channel::<()>();

    tokio::spawn(WorkerServer::serve_with_listener(
        listener,
        service.clone(),
        async {
            let _ = signal.await;
        },
    ));

    let client = WorkerClient::connect(format!("http://{}", addr)).await.unwrap();
    TestWorker {
        client,
        service,
        shutdown: Some(shutdown),
    }
}

fn echo(latency: Duration) -> Arc<dyn TokenStrategy> {
    Arc::new(EchoStrategy::new("gpt-small", LatencyInjector::new(latency)))
}

fn request(request_id: &str, prompt: &str, max_tokens: i32) -> GenerateRequest {
    GenerateRequest {
        request_id: request_id.to_string(),
        model: "gpt-small".to_string(),
        prompt: prompt.to_string(),
        max_tokens,
        temperature: 0.7,
        priority: 0,
    }
}

/// Exactly one terminal event, last, with counts increasing by one before it
fn assert_well_formed(events: &[TokenResponse], max_tokens: i32) {
    let (terminal, tokens) = events.split_last().expect("stream produced no events");
    assert!(terminal.is_terminal());
    assert!(!(terminal.finished && terminal.error.is_some()));
    assert!(tokens.iter().all(|e| !e.is_terminal()));
    assert!(tokens.len() as i32 <= max_tokens);

    for (i, event) in tokens.iter().enumerate() {
        assert_eq!(event.token_count, i as i32 + 1);
    }
    assert_eq!(terminal.token_count, tokens.len() as i32);
}

async fn wait_until_idle(service: &GenerationService) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !service.in_flight().is_empty() || service.active_compute_contexts() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not release cancelled streams");
}

/// Fails part-way through any prompt that starts with "fail"
struct FlakyStrategy {
    echo: EchoStrategy,
}

impl TokenStrategy for FlakyStrategy {
    fn name(&self) -> &str {
        "flaky"
    }

    fn generate(&self, request: &GenerationRequest, sink: &mut TokenSink) -> Result<()> {
        if request.prompt.starts_with("fail") {
            sink.push("partial ")?;
            sink.push("output ")?;
            return Err(RelayError::generation("decoding failed"));
        }
        self.echo.generate(request, sink)
    }
}

#[tokio::test]
async fn test_echo_stream_over_grpc() {
    let worker = start_worker(echo(Duration::ZERO)).await;

    let events = worker
        .client
        .generate_all(request("req-1", "hello world", 5))
        .await
        .unwrap();

    let tokens: Vec<&str> = events[..events.len() - 1]
        .iter()
        .map(|e| e.token.as_str())
        .collect();
    assert_eq!(tokens, vec!["[gpt-small] ", "hello ", "world "]);

    let terminal = events.last().unwrap();
    assert!(terminal.finished);
    assert_eq!(terminal.error, None);
    assert_eq!(terminal.token_count, 3);
    assert!(events.iter().all(|e| e.request_id == "req-1"));
}

#[tokio::test]
async fn test_empty_prompt_rejected() {
    let worker = start_worker(echo(Duration::ZERO)).await;

    for _ in 0..3 {
        let err = worker
            .client
            .generate(request("req-empty", "", 5))
            .await
            .err()
            .expect("empty prompt was accepted");
        match err {
            RelayError::Rpc(status) => assert_eq!(status.code(), Code::InvalidArgument),
            other => panic!("expected rpc status, got {:?}", other),
        }
    }

    assert_eq!(worker.service.metrics().generate.requests_rejected.get(), 3);
    assert_eq!(worker.service.metrics().generate.active_streams.get(), 0);
}

#[tokio::test]
async fn test_invalid_max_tokens_rejected() {
    let worker = start_worker(echo(Duration::ZERO)).await;

    let err = worker.client.generate(request("req-0", "hello", 0)).await.err();
    assert!(matches!(err, Some(RelayError::Rpc(status)) if status.code() == Code::InvalidArgument));
}

#[tokio::test]
async fn test_missing_request_id_is_assigned() {
    let worker = start_worker(echo(Duration::ZERO)).await;

    let events = worker.client.generate_all(request("", "hello", 5)).await.unwrap();
    let request_id = &events[0].request_id;
    assert!(!request_id.is_empty());
    assert!(events.iter().all(|e| &e.request_id == request_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_are_isolated() {
    let worker = start_worker(echo(Duration::from_millis(2))).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let client = worker.client.clone();
        handles.push(tokio::spawn(async move {
            let request_id = format!("req-{}", i);
            let prompt = format!("alpha{i} beta{i} gamma{i} delta{i}");
            let events = client.generate_all(request(&request_id, &prompt, 8)).await.unwrap();
            (i, request_id, events)
        }));
    }

    for handle in handles {
        let (i, request_id, events) = handle.await.unwrap();
        assert_well_formed(&events, 8);
        assert!(events.last().unwrap().finished);
        assert!(events.iter().all(|e| e.request_id == request_id));

        let words: Vec<&str> = events[1..events.len() - 1]
            .iter()
            .map(|e| e.token.trim_end())
            .collect();
        assert_eq!(
            words,
            vec![
                format!("alpha{i}"),
                format!("beta{i}"),
                format!("gamma{i}"),
                format!("delta{i}")
            ]
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_is_contained_to_its_stream() {
    let strategy = Arc::new(FlakyStrategy {
        echo: EchoStrategy::new("gpt-small", LatencyInjector::new(Duration::from_millis(1))),
    });
    let worker = start_worker(strategy).await;

    let failing = {
        let client = worker.client.clone();
        tokio::spawn(async move { client.generate_all(request("req-bad", "fail now", 5)).await })
    };
    let healthy: Vec<_> = (0..4)
        .map(|i| {
            let client = worker.client.clone();
            tokio::spawn(async move {
                client
                    .generate_all(request(&format!("req-ok-{}", i), "one two three", 5))
                    .await
            })
        })
        .collect();

    let events = failing.await.unwrap().unwrap();
    assert_well_formed(&events, 5);
    let terminal = events.last().unwrap();
    assert!(!terminal.finished);
    assert!(terminal.error.as_deref().unwrap().contains("decoding failed"));
    assert_eq!(terminal.token_count, 2);

    for handle in healthy {
        let events = handle.await.unwrap().unwrap();
        assert_well_formed(&events, 5);
        assert!(events.last().unwrap().finished);
    }

    let health = worker.client.health().await.unwrap();
    assert!(health.healthy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_streams_release_compute_contexts() {
    let worker = start_worker(echo(Duration::from_millis(50))).await;
    let prompt = "one two three four five six seven eight nine ten";

    for cycle in 0..5 {
        let mut stream = worker
            .client
            .generate(request(&format!("req-cancel-{}", cycle), prompt, 5))
            .await
            .unwrap();

        for expected in 1..=2 {
            let event = stream.message().await.unwrap().unwrap();
            assert_eq!(event.token_count, expected);
            assert!(!event.is_terminal());
        }
        drop(stream);

        wait_until_idle(&worker.service).await;
    }

    let metrics = &worker.service.metrics().generate;
    assert_eq!(metrics.requests_cancelled.get(), 5);
    assert_eq!(metrics.requests_completed.get(), 0);
    assert_eq!(metrics.active_streams.get(), 0);
    assert_eq!(metrics.compute_contexts.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_request_id_can_be_reused() {
    let worker = start_worker(echo(Duration::from_millis(50))).await;

    let mut stream = worker
        .client
        .generate(request("req-reuse", "a b c d e f", 6))
        .await
        .unwrap();
    stream.message().await.unwrap().unwrap();
    drop(stream);
    wait_until_idle(&worker.service).await;

    let events = worker
        .client
        .generate_all(request("req-reuse", "a b", 6))
        .await
        .unwrap();
    assert!(events.last().unwrap().finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_responds_while_streams_in_flight() {
    let worker = start_worker(echo(Duration::from_millis(100))).await;
    let prompt = (0..20).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");

    let mut streams = Vec::new();
    for i in 0..100 {
        let stream = worker
            .client
            .generate(request(&format!("req-{}", i), &prompt, 20))
            .await
            .unwrap();
        streams.push(stream);
    }

    let started = Instant::now();
    let health = worker.client.health().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(health.healthy);
    assert!(health.current_queue_size > 0);
    assert!(health.current_queue_size <= 100);

    drop(streams);
    wait_until_idle(&worker.service).await;
    assert_eq!(worker.client.health().await.unwrap().current_queue_size, 0);
}
