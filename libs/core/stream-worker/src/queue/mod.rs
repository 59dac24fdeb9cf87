//! Partitioned, at-least-once queue abstraction.
//!
//! A topic is split into a fixed number of partitions; records with the same
//! key land in the same partition. Consumers read a partition as a lazy
//! stream of batches and commit offsets once a record's outcome is durable.

mod lease;
mod memory;
mod redis_streams;

pub(crate) use lease::Heartbeat;
pub use lease::Lease;
pub use memory::InMemoryQueue;
pub use redis_streams::RedisQueue;

use crate::error::QueueError;
use crate::record::{Batch, DeliveryRecord, PublishAck};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of batches for one topic partition. Ends when the client is closed.
pub type BatchStream = BoxStream<'static, Result<Batch, QueueError>>;

/// Queue client shared by the ingestion endpoint and every partition loop.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Append `record` to the partition chosen by its key.
    ///
    /// Returns once the configured acknowledgement tier is satisfied.
    async fn publish(&self, topic: &str, record: &DeliveryRecord)
    -> Result<PublishAck, QueueError>;

    /// Number of partitions of `topic`.
    fn partitions(&self, topic: &str) -> u32;

    /// Consume one partition of `topic` as a member of `group`.
    ///
    /// The stream parks until records are available and yields `None` once
    /// [`close`](Self::close) is called. Uncommitted records are delivered
    /// again to the next consumer of the partition.
    fn consume(&self, topic: &str, group: &str, partition: u32) -> BatchStream;

    /// Mark records done for `group`.
    async fn commit(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        offsets: &[String],
    ) -> Result<(), QueueError>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Unblock every parked consumer and end their streams.
    fn close(&self);

    fn name(&self) -> &'static str;
}
