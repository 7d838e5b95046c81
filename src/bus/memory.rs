//! In-memory bus for tests and single-process deployments.
//!
//! A [`MemoryBus`] is a broker: topic logs partitioned by key hash, consumer
//! groups with per-partition committed offsets, and delivery reports for
//! every append. Consumer handles created from the same bus share the
//! broker state; each handle tracks its own fetch positions so subscribing
//! late starts at the log end, matching `auto.offset.reset=largest`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::trace;

use crate::errors::{ConsumerError, ProducerError};

use super::{BusConsumer, BusProducer, BusRecord, DeliveryReport};

#[derive(Debug, Default)]
struct TopicLog {
    /// One append-only log per partition
    partitions: Vec<Vec<StoredRecord>>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    /// (group, topic, partition) → committed offset
    committed: HashMap<(String, String, i32), i64>,
    closed: bool,
}

/// Shared in-process broker.
pub struct MemoryBus {
    partitions_per_topic: usize,
    state: Arc<Mutex<BrokerState>>,
    /// Bumped on every append or close so fetchers re-check
    version_tx: watch::Sender<u64>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_partitions(1)
    }

    pub fn with_partitions(partitions_per_topic: usize) -> Arc<Self> {
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            partitions_per_topic: partitions_per_topic.max(1),
            state: Arc::new(Mutex::new(BrokerState::default())),
            version_tx,
        })
    }

    /// A consumer handle for a group. Each worker owns its own handle.
    pub fn consumer(self: &Arc<Self>, group: &str) -> MemoryConsumer {
        MemoryConsumer {
            bus: self.clone(),
            group: group.to_string(),
            positions: Mutex::new(HashMap::new()),
            version_rx: self.version_tx.subscribe(),
        }
    }

    /// A producer handle.
    pub fn producer(self: &Arc<Self>) -> MemoryProducer {
        MemoryProducer {
            bus: self.clone(),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Close the bus: fetchers drain their backlog and then see end-of-log.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.version_tx.send_modify(|v| *v += 1);
    }

    /// All payloads appended to a topic, across partitions in offset order
    /// per partition. Test observability.
    pub async fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| {
                log.partitions
                    .iter()
                    .flat_map(|p| p.iter().map(|r| r.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Committed offset for a (group, topic, partition). Test observability.
    pub async fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn partition_for(&self, key: Option<&str>, explicit: Option<i32>) -> usize {
        if let Some(p) = explicit {
            return (p as usize) % self.partitions_per_topic;
        }
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() as usize) % self.partitions_per_topic
            }
            None => 0,
        }
    }

    async fn append(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: Vec<u8>,
        key: &str,
    ) -> Result<DeliveryReport, ProducerError> {
        let partition = self.partition_for(Some(key), partition);
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ProducerError::ProduceFailed {
                topic: topic.to_string(),
                details: "bus closed".to_string(),
            });
        }
        let partitions_per_topic = self.partitions_per_topic;
        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog {
                partitions: vec![Vec::new(); partitions_per_topic],
            });
        let offset = log.partitions[partition].len() as i64;
        log.partitions[partition].push(StoredRecord {
            key: Some(key.to_string()),
            payload,
        });
        drop(state);
        self.version_tx.send_modify(|v| *v += 1);
        trace!(topic, partition, offset, "Appended record to memory bus");
        Ok(DeliveryReport {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
            key: key.to_string(),
            error: None,
        })
    }
}

/// Consumer handle over a [`MemoryBus`].
pub struct MemoryConsumer {
    bus: Arc<MemoryBus>,
    group: String,
    /// (topic, partition) → next offset to deliver
    positions: Mutex<HashMap<(String, i32), i64>>,
    version_rx: watch::Receiver<u64>,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError> {
        let state = self.bus.state.lock().await;
        let mut positions = self.positions.lock().await;
        for topic in topics {
            for partition in 0..self.bus.partitions_per_topic {
                // start at the log end: new subscriptions do not drain history
                let end = state
                    .topics
                    .get(topic)
                    .map(|log| log.partitions[partition].len() as i64)
                    .unwrap_or(0);
                positions
                    .entry((topic.clone(), partition as i32))
                    .or_insert(end);
            }
        }
        Ok(())
    }

    async fn fetch(&self) -> Option<BusRecord> {
        let mut version_rx = self.version_rx.clone();
        loop {
            {
                let state = self.bus.state.lock().await;
                let mut positions = self.positions.lock().await;
                for ((topic, partition), position) in positions.iter_mut() {
                    let Some(log) = state.topics.get(topic) else {
                        continue;
                    };
                    let records = &log.partitions[*partition as usize];
                    if let Some(record) = records.get(*position as usize) {
                        let fetched = BusRecord {
                            topic: topic.clone(),
                            partition: *partition,
                            offset: *position,
                            key: record.key.clone(),
                            payload: record.payload.clone(),
                        };
                        *position += 1;
                        return Some(fetched);
                    }
                }
                if state.closed {
                    return None;
                }
            }
            // no backlog: wait for an append or close
            if version_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), ConsumerError> {
        let mut state = self.bus.state.lock().await;
        let entry = state
            .committed
            .entry((self.group.clone(), topic.to_string(), partition))
            .or_insert(-1);
        if offset < *entry {
            return Err(ConsumerError::CommitFailed {
                topic: topic.to_string(),
                partition,
                offset,
                details: format!("commit would regress from {}", *entry),
            });
        }
        *entry = offset;
        Ok(())
    }

    async fn disconnect(&self) {
        self.positions.lock().await.clear();
    }
}

/// Producer handle over a [`MemoryBus`].
pub struct MemoryProducer {
    bus: Arc<MemoryBus>,
    reports: Mutex<Vec<DeliveryReport>>,
}

#[async_trait]
impl BusProducer for MemoryProducer {
    async fn send(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: Vec<u8>,
        key: &str,
    ) -> Result<(), ProducerError> {
        let report = self.bus.append(topic, partition, payload, key).await?;
        self.reports.lock().await.push(report);
        Ok(())
    }

    async fn poll(&self) -> Vec<DeliveryReport> {
        std::mem::take(&mut *self.reports.lock().await)
    }

    async fn flush(&self) {
        // appends are synchronous: reports are already queued
    }

    async fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_starts_at_log_end() {
        let bus = MemoryBus::new();
        let producer = bus.producer();
        producer
            .send("topic_a", None, b"before".to_vec(), "k1")
            .await
            .unwrap();

        let consumer = bus.consumer("group");
        consumer
            .subscribe(&["topic_a".to_string()])
            .await
            .unwrap();
        producer
            .send("topic_a", None, b"after".to_vec(), "k2")
            .await
            .unwrap();

        let record = consumer.fetch().await.unwrap();
        assert_eq!(record.payload, b"after");
    }

    #[tokio::test]
    async fn test_fetch_blocks_until_append() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("group");
        consumer
            .subscribe(&["topic_a".to_string()])
            .await
            .unwrap();

        let bus_clone = bus.clone();
        let fetcher = tokio::spawn(async move { consumer.fetch().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus_clone
            .producer()
            .send("topic_a", None, b"x".to_vec(), "k")
            .await
            .unwrap();

        let record = fetcher.await.unwrap().unwrap();
        assert_eq!(record.payload, b"x");
    }

    #[tokio::test]
    async fn test_offsets_ascend_per_partition() {
        let bus = MemoryBus::new();
        let producer = bus.producer();
        let consumer = bus.consumer("group");
        consumer
            .subscribe(&["topic_a".to_string()])
            .await
            .unwrap();
        for i in 0..3u8 {
            producer
                .send("topic_a", None, vec![i], "k")
                .await
                .unwrap();
        }
        for expected in 0..3i64 {
            let record = consumer.fetch().await.unwrap();
            assert_eq!(record.offset, expected);
            consumer
                .commit(&record.topic, record.partition, record.offset)
                .await
                .unwrap();
        }
        assert_eq!(bus.committed("group", "topic_a", 0).await, Some(2));
    }

    #[tokio::test]
    async fn test_commit_regression_rejected() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("group");
        consumer.commit("t", 0, 5).await.unwrap();
        let err = consumer.commit("t", 0, 3).await.unwrap_err();
        assert!(matches!(err, ConsumerError::CommitFailed { .. }));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let bus = MemoryBus::new();
        let producer = bus.producer();
        let consumer = bus.consumer("group");
        consumer
            .subscribe(&["topic_a".to_string()])
            .await
            .unwrap();
        producer
            .send("topic_a", None, b"last".to_vec(), "k")
            .await
            .unwrap();
        bus.close().await;
        assert!(consumer.fetch().await.is_some());
        assert!(consumer.fetch().await.is_none());
    }

    #[tokio::test]
    async fn test_delivery_reports_surface_on_poll() {
        let bus = MemoryBus::new();
        let producer = bus.producer();
        producer
            .send("topic_a", None, b"x".to_vec(), "key-1")
            .await
            .unwrap();
        let reports = producer.poll().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key, "key-1");
        assert!(reports[0].error.is_none());
        assert!(producer.poll().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_lands_in_same_partition() {
        let bus = MemoryBus::with_partitions(4);
        let producer = bus.producer();
        let mut partitions = std::collections::HashSet::new();
        for _ in 0..3 {
            producer
                .send("topic_a", None, b"x".to_vec(), "stable-key")
                .await
                .unwrap();
        }
        for report in producer.poll().await {
            partitions.insert(report.partition);
        }
        assert_eq!(partitions.len(), 1);
    }
}
