//! Log-bus abstraction.
//!
//! The engine talks to the partitioned, ordered log through two traits so
//! different backends can be used interchangeably: an offset-committable
//! consumer and a delivery-report producer. The in-memory implementation in
//! [`memory`] backs tests and single-process deployments; a Kafka binding
//! plugs into the same traits with the client settings carried by the
//! service config (`auto.offset.reset=largest` on new subscriptions,
//! auto-commit disabled, `request.required.acks=1`, delivery reports on).
//!
//! Reliability contract: at-least-once. Offsets are committed manually by
//! the consumer side only after processing reaches a terminal outcome, and
//! produced messages are confirmed through delivery reports surfaced by
//! [`BusProducer::poll`].

use async_trait::async_trait;

use crate::errors::{ConsumerError, ProducerError};

mod memory;
mod producer;

pub use memory::MemoryBus;
pub use producer::GuaranteedProducer;

/// One record fetched from the bus.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Broker confirmation for one produced message.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    /// Send-level failure reported by the broker, if any
    pub error: Option<String>,
}

/// Offset-committable consumer handle, owned by exactly one worker.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Subscribe to a set of topics. New subscriptions start at the log end
    /// (`largest`) so freshly added rules do not drain history.
    async fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError>;

    /// Fetch the next record from any subscribed partition. Returns `None`
    /// once the bus is closed and drained.
    async fn fetch(&self) -> Option<BusRecord>;

    /// Commit an offset. The position is the offset of the processed record;
    /// commits must be monotonic per partition.
    async fn commit(&self, topic: &str, partition: i32, offset: i64)
        -> Result<(), ConsumerError>;

    async fn disconnect(&self);
}

/// Fire-level producer handle. Delivery confirmation is asynchronous: `send`
/// enqueues, `poll` surfaces the broker's reports.
#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: Vec<u8>,
        key: &str,
    ) -> Result<(), ProducerError>;

    /// Drain pending delivery reports.
    async fn poll(&self) -> Vec<DeliveryReport>;

    /// Block until every sent message has a report available.
    async fn flush(&self);

    async fn disconnect(&self);
}
