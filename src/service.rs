//! Service assembly: rule compilation and worker spawning.
//!
//! The binary and the integration tests build the same topology through this
//! module: one source worker per distinct rule topic, one retry worker per
//! rule, all sharing the executor, the guaranteed producer and a
//! cancellation token for coordinated shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::bus::{BusConsumer, GuaranteedProducer};
use crate::consumer::ConsumerWorker;
use crate::engine::{Rule, RuleSpec};
use crate::errors::RuleError;
use crate::executor::{Executor, ExecutorConfig};
use crate::metrics::SharedMetricsPublisher;
use crate::registry::RuleRegistry;

/// Compile a parsed rules document. Any invalid rule is fatal.
pub fn compile_rules(
    specs: &[(String, RuleSpec)],
    default_timeout: Duration,
) -> Result<Vec<Rule>, RuleError> {
    specs
        .iter()
        .map(|(name, spec)| Rule::new(name, spec, default_timeout))
        .collect()
}

/// Handles over a running service topology.
pub struct ServiceHandles {
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    pub producer: Arc<GuaranteedProducer>,
    pub executor: Arc<Executor>,
}

impl ServiceHandles {
    /// Stop fetching, let in-flight events terminate, flush the producer.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.producer.shutdown().await;
        info!("Service stopped");
    }
}

/// Spawn the full worker topology. `consumer_factory` yields one fresh bus
/// consumer handle per worker, keyed by its consumer-group name.
pub fn start<F>(
    registry: Arc<RuleRegistry>,
    consumer_factory: F,
    producer: Arc<GuaranteedProducer>,
    http: reqwest::Client,
    metrics: SharedMetricsPublisher,
    consumer_group: &str,
    consume_dc: &str,
    executor_config: ExecutorConfig,
) -> ServiceHandles
where
    F: Fn(&str) -> Arc<dyn BusConsumer>,
{
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let executor = Arc::new(Executor::new(
        registry.clone(),
        producer.clone(),
        http,
        metrics.clone(),
        executor_config,
    ));

    for topic in registry.source_topics() {
        let group = format!("{consumer_group}-{topic}");
        let worker = ConsumerWorker::source(
            consumer_factory(&group),
            executor.clone(),
            metrics.clone(),
            cancel.clone(),
            consume_dc,
            topic,
        );
        tracker.spawn(worker.run());
    }
    for retry_topic in registry.retry_topics() {
        let group = format!("{consumer_group}-{retry_topic}");
        let worker = ConsumerWorker::retry(
            consumer_factory(&group),
            executor.clone(),
            metrics.clone(),
            cancel.clone(),
            retry_topic,
        );
        tracker.spawn(worker.run());
    }
    info!(
        source_topics = registry.source_topics().len(),
        retry_topics = registry.retry_topics().len(),
        "Service workers started"
    );

    ServiceHandles {
        cancel,
        tracker,
        producer,
        executor,
    }
}
