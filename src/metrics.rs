//! Metrics publishing for service observability.
//!
//! A small cadence-compatible trait with a no-op implementation for tests
//! and a statsd-backed one for deployments. Workers and the executor count
//! events consumed, decode failures, exec outcomes, retries produced and
//! loops detected, and time exec latency.

use async_trait::async_trait;
use cadence::{
    BufferedUdpMetricSink, Counted, CountedExt, Gauged, QueuingMetricSink, StatsdClient, Timed,
};
use std::net::UdpSocket;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Counter, gauge and timing publication.
#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    /// Increment a counter by 1
    async fn incr(&self, key: &str);

    /// Increment a counter by 1 with tags
    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]);

    /// Increment a counter by a specific value
    async fn count(&self, key: &str, value: u64);

    /// Record a gauge value
    async fn gauge(&self, key: &str, value: u64);

    /// Record a timing in milliseconds
    async fn time(&self, key: &str, millis: u64);
}

/// No-op implementation for development and testing
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsPublisher;

impl NoOpMetricsPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsPublisher for NoOpMetricsPublisher {
    async fn incr(&self, _key: &str) {}
    async fn incr_with_tags(&self, _key: &str, _tags: &[(&str, &str)]) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn gauge(&self, _key: &str, _value: u64) {}
    async fn time(&self, _key: &str, _millis: u64) {}
}

/// Statsd-backed metrics publisher using cadence
pub struct StatsdMetricsPublisher {
    client: StatsdClient,
}

impl StatsdMetricsPublisher {
    pub fn new(host: &str, prefix: &str) -> Result<Self, MetricsError> {
        let socket =
            UdpSocket::bind("[::]:0").map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;

        let buffered_sink = BufferedUdpMetricSink::from(host, socket)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        let queuing_sink = QueuingMetricSink::builder()
            .with_error_handler(move |error| {
                error!("Failed to send metric via sink: {}", error);
            })
            .build(buffered_sink);
        let client = StatsdClient::from_sink(prefix, queuing_sink);

        Ok(Self { client })
    }
}

#[async_trait]
impl MetricsPublisher for StatsdMetricsPublisher {
    async fn incr(&self, key: &str) {
        if let Err(e) = self.client.incr(key) {
            error!("Failed to send metric {}: {}", key, e);
        }
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        let mut builder = self.client.incr_with_tags(key);
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        let _ = builder.send();
    }

    async fn count(&self, key: &str, value: u64) {
        let _ = self.client.count(key, value);
    }

    async fn gauge(&self, key: &str, value: u64) {
        let _ = self.client.gauge(key, value);
    }

    async fn time(&self, key: &str, millis: u64) {
        let _ = self.client.time(key, millis);
    }
}

/// Type alias for shared metrics publisher
pub type SharedMetricsPublisher = Arc<dyn MetricsPublisher>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("error-changeprop-metrics-1 Failed to create metrics publisher: {0}")]
    CreationFailed(String),
}

/// Statsd when a host is configured, no-op otherwise.
pub fn create_metrics_publisher(
    statsd_host: Option<&str>,
    prefix: &str,
) -> Result<SharedMetricsPublisher, MetricsError> {
    match statsd_host {
        Some(host) => Ok(Arc::new(StatsdMetricsPublisher::new(host, prefix)?)),
        None => Ok(Arc::new(NoOpMetricsPublisher::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_publisher_accepts_everything() {
        let publisher = NoOpMetricsPublisher::new();
        publisher.incr("events.consumed").await;
        publisher.incr_with_tags("exec.outcome", &[("rule", "simple_test_rule")]).await;
        publisher.count("retries.produced", 3).await;
        publisher.gauge("pending.produces", 0).await;
        publisher.time("exec.latency", 12).await;
    }

    #[test]
    fn test_create_defaults_to_noop() {
        let publisher = create_metrics_publisher(None, "changeprop").unwrap();
        let _: SharedMetricsPublisher = publisher;
    }
}
