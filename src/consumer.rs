//! Consumer workers: one per (topic, consumer group).
//!
//! A worker owns its bus consumer handle, fetches records, decodes them and
//! hands them to the executor, committing each offset only once processing
//! reached a terminal outcome. Records are dispatched to per-partition lanes:
//! within a partition processing is serialized and commits are monotonic,
//! across partitions records process in parallel. An undecodable payload is
//! logged and committed past, never crashing the worker.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

use crate::bus::{BusConsumer, BusRecord};
use crate::errors::ConsumerError;
use crate::event::Event;
use crate::executor::Executor;
use crate::metrics::SharedMetricsPublisher;
use crate::registry::prefixed_topic;

/// What a worker's topic means to the executor.
enum WorkerKind {
    /// Source topic carrying domain events; the logical (unprefixed) name
    Source { topic: String },
    /// Per-rule retry topic carrying retry envelopes
    Retry { topic: String },
}

/// Per-(topic, group) consume → dispatch → commit loop.
pub struct ConsumerWorker {
    consumer: Arc<dyn BusConsumer>,
    executor: Arc<Executor>,
    metrics: SharedMetricsPublisher,
    cancel: CancellationToken,
    kind: WorkerKind,
    /// The physical subscription name
    subscribe_topic: String,
}

impl ConsumerWorker {
    /// Worker for a source topic, subscribed under its datacenter prefix.
    pub fn source(
        consumer: Arc<dyn BusConsumer>,
        executor: Arc<Executor>,
        metrics: SharedMetricsPublisher,
        cancel: CancellationToken,
        consume_dc: &str,
        topic: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            executor,
            metrics,
            cancel,
            subscribe_topic: prefixed_topic(consume_dc, topic),
            kind: WorkerKind::Source {
                topic: topic.to_string(),
            },
        })
    }

    /// Worker for a retry topic. Retry topics are not datacenter-prefixed.
    pub fn retry(
        consumer: Arc<dyn BusConsumer>,
        executor: Arc<Executor>,
        metrics: SharedMetricsPublisher,
        cancel: CancellationToken,
        retry_topic: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            executor,
            metrics,
            cancel,
            subscribe_topic: retry_topic.to_string(),
            kind: WorkerKind::Retry {
                topic: retry_topic.to_string(),
            },
        })
    }

    /// Run until cancellation or end of log. In-flight events terminate and
    /// commit before the consumer disconnects.
    #[instrument(skip(self), fields(topic = %self.subscribe_topic))]
    pub async fn run(self: Arc<Self>) -> Result<(), ConsumerError> {
        self.consumer
            .subscribe(std::slice::from_ref(&self.subscribe_topic))
            .await?;
        info!("Consumer worker subscribed");

        let tracker = TaskTracker::new();
        let mut lanes: HashMap<i32, mpsc::Sender<BusRecord>> = HashMap::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Consumer worker shutting down");
                    break;
                }
                record = self.consumer.fetch() => {
                    let Some(record) = record else {
                        debug!("Bus closed, worker draining");
                        break;
                    };
                    let lane = lanes.entry(record.partition).or_insert_with(|| {
                        spawn_partition_lane(&tracker, self.clone())
                    });
                    if lane.send(record).await.is_err() {
                        break;
                    }
                }
            }
        }

        drop(lanes);
        tracker.close();
        tracker.wait().await;
        self.consumer.disconnect().await;
        info!("Consumer worker stopped");
        Ok(())
    }

    async fn handle(&self, record: BusRecord) {
        self.metrics.incr("events.consumed").await;
        match Event::decode(&record.payload) {
            Ok(event) => match &self.kind {
                WorkerKind::Source { topic } => {
                    self.executor.process_source(topic, &event).await;
                }
                WorkerKind::Retry { topic } => {
                    self.executor.process_retry(topic, &event).await;
                }
            },
            Err(e) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Event decode failed, committing past it"
                );
                self.metrics.incr("events.decode_failed").await;
            }
        }

        if let Err(e) = self
            .consumer
            .commit(&record.topic, record.partition, record.offset)
            .await
        {
            error!(error = %e, "Offset commit failed");
        }
    }
}

/// One serialized processing lane per partition. The lane capacity of one
/// keeps the fetch loop from running ahead of uncommitted work.
fn spawn_partition_lane(
    tracker: &TaskTracker,
    worker: Arc<ConsumerWorker>,
) -> mpsc::Sender<BusRecord> {
    let (tx, mut rx) = mpsc::channel::<BusRecord>(1);
    tracker.spawn(async move {
        while let Some(record) = rx.recv().await {
            worker.handle(record).await;
        }
    });
    tx
}
