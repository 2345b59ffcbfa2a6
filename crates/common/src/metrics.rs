//! Metrics collection for TokenRelay
//!
//! Prometheus counters and gauges for the generation service. Every update is
//! a single atomic operation, so they are safe to touch from the stream
//! dispatch path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for TokenRelay
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub generate: GenerateMetrics,
    pub health_checks: IntCounter,
}

/// Streaming generation metrics
#[derive(Debug, Clone)]
pub struct GenerateMetrics {
    /// Generate calls received, accepted or not
    pub requests_total: IntCounter,

    /// Calls rejected before a stream was opened
    pub requests_rejected: IntCounter,

    /// Streams closed with a finished event
    pub requests_completed: IntCounter,

    /// Streams closed with an error event
    pub requests_failed: IntCounter,

    /// Streams dropped by the client before their terminal event
    pub requests_cancelled: IntCounter,

    /// Token fragments delivered to clients
    pub tokens_total: IntCounter,

    /// Streams currently open
    pub active_streams: IntGauge,

    /// Compute contexts currently running a strategy
    pub compute_contexts: IntGauge,

    /// Stream duration, open to terminal event
    pub request_duration: Histogram,

    /// Time from stream open to the first token
    pub time_to_first_token: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Registry::new();

        let generate = GenerateMetrics {
            requests_total: counter(
                &registry,
                "generate_requests_total",
                "Total number of Generate calls",
            ),
            requests_rejected: counter(
                &registry,
                "generate_requests_rejected_total",
                "Generate calls rejected before a stream was opened",
            ),
            requests_completed: counter(
                &registry,
                "generate_requests_completed_total",
                "Streams closed with a finished event",
            ),
            requests_failed: counter(
                &registry,
                "generate_requests_failed_total",
                "Streams closed with an error event",
            ),
            requests_cancelled: counter(
                &registry,
                "generate_requests_cancelled_total",
                "Streams dropped by the client before their terminal event",
            ),
            tokens_total: counter(
                &registry,
                "generate_tokens_total",
                "Token fragments delivered to clients",
            ),
            active_streams: gauge(
                &registry,
                "generate_active_streams",
                "Current number of open generation streams",
            ),
            compute_contexts: gauge(
                &registry,
                "generate_compute_contexts",
                "Current number of compute contexts running a strategy",
            ),
            request_duration: histogram(
                &registry,
                "generate_request_duration_seconds",
                "Stream duration from open to terminal event",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            ),
            time_to_first_token: histogram(
                &registry,
                "generate_time_to_first_token_seconds",
                "Time from stream open to the first token",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            ),
        };

        let health_checks = counter(&registry, "health_checks_total", "Total Health calls");

        MetricsRegistry {
            registry: Arc::new(registry),
            generate,
            health_checks,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.generate.requests_total.inc();
        metrics.generate.active_streams.inc();
        metrics.generate.tokens_total.inc_by(3);

        let output = metrics.gather();
        assert!(output.contains("generate_requests_total 1"));
        assert!(output.contains("generate_tokens_total 3"));
        assert!(output.contains("generate_active_streams 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = MetricsRegistry::new();
        let b = MetricsRegistry::new();

        a.generate.requests_failed.inc();
        assert_eq!(a.generate.requests_failed.get(), 1);
        assert_eq!(b.generate.requests_failed.get(), 0);
    }
}
