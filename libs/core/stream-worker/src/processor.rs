//! Record processors and the batch consumption loop.
//!
//! `BatchProcessor` runs one loop per partition of every consumed topic.
//! Each loop pulls a batch, asks the [`RecordProcessor`] for an [`Outcome`]
//! per record, makes failed records durable on the retry or dead-letter
//! topic, and only then commits them.
//!
//! Records on the retry topic carry a due time. A loop waits until every
//! record of a batch is due before processing it, so each retry backs off
//! exponentially instead of burning through the attempts at once.

use crate::config::WorkerConfig;
use crate::error::ErrorCategory;
use crate::metrics::{names, MetricsSink};
use crate::queue::QueueClient;
use crate::record::{now_ms, Batch, ConsumedRecord, DeliveryRecord};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Done, commit it
    Delivered,
    /// Failed transiently, try again later from the retry topic
    Requeue { reason: String },
    /// Can never succeed, park it on the dead-letter topic
    Dropped { reason: String },
}

impl Outcome {
    pub fn requeue(reason: impl Into<String>) -> Self {
        Outcome::Requeue {
            reason: reason.into(),
        }
    }

    pub fn dropped(reason: impl Into<String>) -> Self {
        Outcome::Dropped {
            reason: reason.into(),
        }
    }
}

/// Trait for record processors.
///
/// Domain handlers implement `process`; the loop calls `process_batch`, which
/// by default handles records one after another in batch order.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Handle a single record. Must not panic on malformed input.
    async fn process(&self, record: &DeliveryRecord) -> Outcome;

    /// One outcome per record, in the same order.
    async fn process_batch(&self, records: &[DeliveryRecord]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.process(record).await);
        }
        outcomes
    }

    /// Processor name for logging and metric labels.
    fn name(&self) -> &'static str;
}

/// Consumption loop over every partition of the consumed topics.
pub struct BatchProcessor<P: RecordProcessor> {
    queue: Arc<dyn QueueClient>,
    processor: Arc<P>,
    metrics: Arc<dyn MetricsSink>,
    config: Arc<WorkerConfig>,
}

impl<P: RecordProcessor> Clone for BatchProcessor<P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            processor: self.processor.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        }
    }
}

impl<P: RecordProcessor + 'static> BatchProcessor<P> {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        processor: P,
        metrics: Arc<dyn MetricsSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            metrics,
            config: Arc::new(config),
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Run until shutdown is signalled or the queue is closed.
    ///
    /// Shutdown is observed only between batches: a batch that has started is
    /// always finished, so no delivery is cut off half way.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut loops = JoinSet::new();

        for topic in self.config.consumed_topics() {
            let partitions = self.queue.partitions(&topic);
            for partition in 0..partitions {
                let this = self.clone();
                let topic = topic.clone();
                let shutdown = shutdown.clone();
                loops.spawn(async move { this.run_partition(topic, partition, shutdown).await });
            }
        }

        info!(
            processor = %self.processor.name(),
            queue = %self.queue.name(),
            group = %self.config.consumer_group,
            loops = loops.len(),
            "Batch processor started"
        );

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Partition loop aborted");
            }
        }

        info!(processor = %self.processor.name(), "Batch processor stopped");
    }

    async fn run_partition(&self, topic: String, partition: u32, mut shutdown: watch::Receiver<bool>) {
        let mut batches = self
            .queue
            .consume(&topic, &self.config.consumer_group, partition);
        let mut consecutive_errors: u32 = 0;

        debug!(topic = %topic, partition, "Partition loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = batches.next() => next,
            };

            match next {
                None => break,
                Some(Ok(batch)) => {
                    if consecutive_errors > 0 {
                        info!(topic = %topic, partition, "Queue recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }

                    let wait = batch.due_in(now_ms());
                    if !wait.is_zero() {
                        debug!(
                            topic = %topic,
                            partition,
                            wait_ms = wait.as_millis() as u64,
                            "Waiting for retried records to become due"
                        );
                        // Uncommitted records are redelivered after a restart
                        tokio::select! {
                            biased;
                            _ = shutdown.wait_for(|stop| *stop) => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }

                    self.handle_batch(&batch).await;
                }
                Some(Err(e)) => {
                    let backoff = Duration::from_millis(
                        ErrorCategory::Transient.backoff_delay_ms(consecutive_errors.min(5)),
                    );
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        topic = %topic,
                        partition,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Queue read failed, backing off"
                    );

                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        debug!(topic = %topic, partition, "Partition loop stopped");
    }

    /// Process one batch and commit every record whose outcome is durable.
    ///
    /// Nothing is rerouted or committed once the partition lease is lost;
    /// the new owner gets every uncommitted record again.
    pub async fn handle_batch(&self, batch: &Batch) {
        let started = Instant::now();

        if !batch.is_owned() {
            warn!(
                topic = %batch.topic,
                partition = batch.partition,
                records = batch.len(),
                "Partition lease lost before processing, leaving batch to the new owner"
            );
            return;
        }

        let records: Vec<DeliveryRecord> =
            batch.records.iter().map(|c| c.record.clone()).collect();
        let outcomes = self.processor.process_batch(&records).await;

        if !batch.is_owned() {
            warn!(
                topic = %batch.topic,
                partition = batch.partition,
                records = batch.len(),
                "Partition lease lost during processing, skipping reroute and commit"
            );
            return;
        }

        if outcomes.len() != batch.len() {
            warn!(
                processor = %self.processor.name(),
                records = batch.len(),
                outcomes = outcomes.len(),
                "Processor returned a mismatched number of outcomes, unmatched records stay pending"
            );
        }

        let mut done = Vec::with_capacity(batch.len());
        for (consumed, outcome) in batch.records.iter().zip(outcomes) {
            self.metrics.incr(names::PROCESSED);

            let durable = match outcome {
                Outcome::Delivered => true,
                Outcome::Requeue { reason } => {
                    self.metrics.incr(names::ERRORS);
                    self.reroute(consumed, reason, false).await
                }
                Outcome::Dropped { reason } => {
                    self.metrics.incr(names::ERRORS);
                    self.metrics.incr(names::DROPPED);
                    self.reroute(consumed, reason, true).await
                }
            };

            if durable {
                done.push(consumed.offset.clone());
            }
        }

        if let Err(e) = self
            .queue
            .commit(&batch.topic, batch.partition, &self.config.consumer_group, &done)
            .await
        {
            warn!(
                topic = %batch.topic,
                partition = batch.partition,
                error = %e,
                "Commit failed, records will be redelivered"
            );
        }

        self.metrics
            .observe(names::PROCESSING_DURATION, started.elapsed());
        debug!(
            topic = %batch.topic,
            partition = batch.partition,
            records = batch.len(),
            committed = done.len(),
            "Batch processed"
        );
    }

    /// Publish a failed record to the retry or dead-letter topic.
    ///
    /// Returns false when the publish failed; the consumed record then stays
    /// uncommitted and the queue delivers it again.
    async fn reroute(&self, consumed: &ConsumedRecord, reason: String, permanent: bool) -> bool {
        let next = consumed.record.next_attempt(reason);
        let exhausted = next.attempt >= self.config.max_attempts;

        let (topic, metric, next) = if permanent || exhausted {
            (&self.config.dead_letter_topic, names::DEAD_LETTERED, next)
        } else {
            let delay = self.config.retry_delay(next.attempt);
            (&self.config.retry_topic, names::REQUEUED, next.delayed(delay))
        };

        match self.queue.publish(topic, &next).await {
            Ok(ack) => {
                self.metrics.incr(metric);
                warn!(
                    key = %next.key,
                    attempt = next.attempt,
                    reason = next.last_error.as_deref().unwrap_or_default(),
                    to = %topic,
                    partition = ack.partition,
                    permanent,
                    "Delivery failed, record republished"
                );
                true
            }
            Err(e) => {
                error!(
                    key = %next.key,
                    to = %topic,
                    error = %e,
                    "Republish failed, leaving record uncommitted"
                );
                false
            }
        }
    }
}
