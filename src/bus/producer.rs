//! Produce-with-ack wrapper over the raw bus producer.
//!
//! A [`GuaranteedProducer`] resolves each `produce` call only when the broker
//! confirms delivery. Correlation is by `<topic>:<key>`: the caller's key is
//! mandatory, and a key may have at most one produce in flight — callers
//! serialize by key. A background task polls the underlying producer for
//! delivery reports and resolves the matching waiters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::PRODUCER_POLL_INTERVAL_MS;
use crate::errors::ProducerError;

use super::{BusProducer, DeliveryReport};

type PendingMap = HashMap<String, oneshot::Sender<Result<DeliveryReport, ProducerError>>>;

/// Delivery-confirmed producer.
pub struct GuaranteedProducer {
    inner: Arc<dyn BusProducer>,
    pending: Arc<Mutex<PendingMap>>,
    cancel: CancellationToken,
}

impl GuaranteedProducer {
    pub fn new(inner: Arc<dyn BusProducer>) -> Arc<Self> {
        Self::with_poll_interval(inner, Duration::from_millis(PRODUCER_POLL_INTERVAL_MS))
    }

    /// Custom report-poll cadence, mainly for tests.
    pub fn with_poll_interval(inner: Arc<dyn BusProducer>, poll_interval: Duration) -> Arc<Self> {
        let producer = Arc::new(Self {
            inner,
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(poll_loop(
            producer.inner.clone(),
            producer.pending.clone(),
            producer.cancel.clone(),
            poll_interval,
        ));
        producer
    }

    /// Produce one message and wait for its delivery report.
    pub async fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: Vec<u8>,
        key: &str,
    ) -> Result<DeliveryReport, ProducerError> {
        if key.is_empty() {
            return Err(ProducerError::EmptyKey {
                topic: topic.to_string(),
            });
        }
        let map_key = pending_key(topic, key);
        let receiver = {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&map_key) {
                return Err(ProducerError::DuplicateKey { key: map_key });
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(map_key.clone(), tx);
            rx
        };

        if let Err(e) = self.inner.send(topic, partition, payload, key).await {
            self.pending.lock().await.remove(&map_key);
            return Err(e);
        }
        debug!(topic, key, "Produce in flight, awaiting delivery report");

        match receiver.await {
            Ok(result) => result,
            // resolver dropped: shut down mid-flight
            Err(_) => Err(ProducerError::Shutdown { key: map_key }),
        }
    }

    /// Number of produces awaiting a delivery report.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Stop polling, flush the inner producer and tear it down. Outstanding
    /// waiters resolve with a shutdown error.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        // surface any reports the broker already has
        resolve_reports(&self.pending, self.inner.poll().await).await;
        self.inner.flush().await;
        resolve_reports(&self.pending, self.inner.poll().await).await;
        self.inner.disconnect().await;

        let mut pending = self.pending.lock().await;
        for (key, sender) in pending.drain() {
            let _ = sender.send(Err(ProducerError::Shutdown { key }));
        }
    }
}

fn pending_key(topic: &str, key: &str) -> String {
    format!("{topic}:{key}")
}

async fn poll_loop(
    inner: Arc<dyn BusProducer>,
    pending: Arc<Mutex<PendingMap>>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                resolve_reports(&pending, inner.poll().await).await;
            }
        }
    }
}

async fn resolve_reports(pending: &Mutex<PendingMap>, reports: Vec<DeliveryReport>) {
    if reports.is_empty() {
        return;
    }
    let mut pending = pending.lock().await;
    for report in reports {
        let map_key = pending_key(&report.topic, &report.key);
        match pending.remove(&map_key) {
            Some(sender) => {
                let result = match &report.error {
                    Some(details) => Err(ProducerError::ProduceFailed {
                        topic: report.topic.clone(),
                        details: details.clone(),
                    }),
                    None => Ok(report),
                };
                let _ = sender.send(result);
            }
            None => {
                warn!(key = %map_key, "Delivery report with no waiting producer entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    const FAST_POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_produce_resolves_on_delivery_report() {
        let bus = MemoryBus::new();
        let producer =
            GuaranteedProducer::with_poll_interval(Arc::new(bus.producer()), FAST_POLL);
        let report = producer
            .produce("topic_a", None, b"payload".to_vec(), "key-1")
            .await
            .unwrap();
        assert_eq!(report.topic, "topic_a");
        assert_eq!(report.key, "key-1");
        assert_eq!(producer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_empty_key_rejected_immediately() {
        let bus = MemoryBus::new();
        let producer =
            GuaranteedProducer::with_poll_interval(Arc::new(bus.producer()), FAST_POLL);
        let err = producer
            .produce("topic_a", None, b"x".to_vec(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::EmptyKey { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_key_rejected() {
        let bus = MemoryBus::new();
        let producer =
            GuaranteedProducer::with_poll_interval(Arc::new(bus.producer()), FAST_POLL);
        // hold a pending entry open manually so the key stays in flight
        {
            let (tx, _rx) = oneshot::channel();
            producer
                .pending
                .lock()
                .await
                .insert("topic_a:key-1".to_string(), tx);
        }
        let err = producer
            .produce("topic_a", None, b"x".to_vec(), "key-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::DuplicateKey { .. }));
        // a different key is unaffected
        producer
            .produce("topic_a", None, b"x".to_vec(), "key-2")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_produces_all_resolve() {
        let bus = MemoryBus::new();
        let producer =
            GuaranteedProducer::with_poll_interval(Arc::new(bus.producer()), FAST_POLL);
        let mut handles = Vec::new();
        for i in 0..20 {
            let producer = producer.clone();
            handles.push(tokio::spawn(async move {
                producer
                    .produce("topic_a", None, vec![i], &format!("key-{i}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // pending map returns to empty when idle
        assert_eq!(producer.pending_len().await, 0);
        assert_eq!(bus.payloads("topic_a").await.len(), 20);
    }

    #[tokio::test]
    async fn test_shutdown_resolves_outstanding_waiters() {
        let bus = MemoryBus::new();
        let producer =
            GuaranteedProducer::with_poll_interval(Arc::new(bus.producer()), FAST_POLL);
        let (tx, rx) = oneshot::channel();
        producer
            .pending
            .lock()
            .await
            .insert("topic_a:stuck".to_string(), tx);
        producer.shutdown().await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(ProducerError::Shutdown { .. })
        ));
        assert_eq!(producer.pending_len().await, 0);
    }
}
