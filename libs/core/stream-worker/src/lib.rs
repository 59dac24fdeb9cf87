//! Stream Worker Framework
//!
//! Partitioned queue plumbing and the batch consumption loop.
//!
//! ## Features
//!
//! - **Queue client**: `QueueClient` trait with Redis Streams and in-memory backends
//! - **Partitions**: keys hash to a fixed partition, one lease-holding owner per partition and group
//! - **Batch processor**: one loop per partition, commit only after the outcome is durable
//! - **Retry and dead-letter topics**: failures are republished with an attempt counter and a backoff due time
//! - **Metrics**: injected `MetricsSink`, Prometheus exporter included
//! - **Health endpoints**: liveness, readiness and `/metrics`
//!
//! ## Example
//!
//! ```ignore
//! use stream_worker::{BatchProcessor, PrometheusSink, RedisQueue, QueueConfig, WorkerConfig};
//!
//! let queue = Arc::new(RedisQueue::connect(&url, QueueConfig::from_env()?).await?);
//! let metrics = Arc::new(PrometheusSink::install("mailer", processor.name())?);
//! let worker = BatchProcessor::new(queue, processor, metrics, WorkerConfig::from_env()?);
//! worker.run(shutdown_rx).await;
//! ```

mod config;
mod error;
mod health;
pub mod metrics;
mod processor;
pub mod queue;
mod record;

pub use config::{QueueConfig, WorkerConfig};
pub use error::{ErrorCategory, QueueError};
pub use health::{health_router, HealthResponse, HealthState};
pub use metrics::{MetricsSink, PrometheusSink, RecordingSink};
pub use processor::{BatchProcessor, Outcome, RecordProcessor};
pub use queue::{BatchStream, InMemoryQueue, Lease, QueueClient, RedisQueue};
pub use record::{partition_for, Batch, ConsumedRecord, DeliveryRecord, PublishAck};
