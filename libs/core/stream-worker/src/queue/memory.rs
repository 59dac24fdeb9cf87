//! In-process queue backend.
//!
//! Same contract as the Redis backend: key-hashed partitions, per-group
//! cursors, pending records redelivered to the next consumer of a partition.
//! Used by tests and by `QUEUE_BACKEND=memory` for local runs.

use super::{BatchStream, QueueClient};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::record::{partition_for, Batch, ConsumedRecord, DeliveryRecord, PublishAck};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;

type PartitionKey = (String, u32);
type GroupKey = (String, u32, String);

#[derive(Default)]
struct State {
    logs: HashMap<PartitionKey, Vec<DeliveryRecord>>,
    groups: HashMap<GroupKey, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// First log index not yet handed out
    cursor: usize,
    /// Handed out, not committed
    pending: BTreeSet<usize>,
}

struct Inner {
    partitions: u32,
    batch_size: usize,
    state: Mutex<State>,
    appended: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    fail_publishes: AtomicBool,
}

impl Inner {
    /// Next batch for a consumer: its replay backlog first, then new records.
    async fn next_batch(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        replay: &mut Option<VecDeque<usize>>,
    ) -> Option<Batch> {
        let mut state = self.state.lock().await;
        let State { logs, groups } = &mut *state;

        let log = logs.get(&(topic.to_string(), partition))?;
        let group_state = groups
            .entry((topic.to_string(), partition, group.to_string()))
            .or_default();

        let backlog = replay.get_or_insert_with(|| group_state.pending.iter().copied().collect());

        let mut indexes = Vec::new();
        while indexes.len() < self.batch_size {
            match backlog.pop_front() {
                Some(idx) if group_state.pending.contains(&idx) => indexes.push(idx),
                Some(_) => {}
                None => break,
            }
        }

        if indexes.is_empty() {
            let end = (group_state.cursor + self.batch_size).min(log.len());
            indexes.extend(group_state.cursor..end);
            group_state.cursor = end;
            group_state.pending.extend(indexes.iter().copied());
        }

        if indexes.is_empty() {
            return None;
        }

        let records = indexes
            .into_iter()
            .map(|idx| ConsumedRecord {
                offset: idx.to_string(),
                record: log[idx].clone(),
            })
            .collect();

        Some(Batch {
            topic: topic.to_string(),
            partition,
            records,
            lease: None,
        })
    }
}

/// Queue held entirely in memory. Cloning shares the same queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let (appended, _) = watch::channel(0u64);
        let (closed, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                partitions: config.partitions.max(1),
                batch_size: config.batch_size.max(1),
                state: Mutex::new(State::default()),
                appended,
                closed,
                fail_publishes: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_partitions(partitions: u32) -> Self {
        Self::new(&QueueConfig::new().with_partitions(partitions))
    }

    /// Make every subsequent publish fail (simulates a broker outage)
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every record ever published to `topic`, partition by partition
    pub async fn records(&self, topic: &str) -> Vec<DeliveryRecord> {
        let state = self.inner.state.lock().await;
        (0..self.inner.partitions)
            .filter_map(|p| state.logs.get(&(topic.to_string(), p)))
            .flat_map(|log| log.iter().cloned())
            .collect()
    }

    /// Records of `topic` handed to `group` but not yet committed
    pub async fn pending_count(&self, topic: &str, group: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .groups
            .iter()
            .filter(|((t, _, g), _)| t == topic && g == group)
            .map(|(_, gs)| gs.pending.len())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn publish(
        &self,
        topic: &str,
        record: &DeliveryRecord,
    ) -> Result<PublishAck, QueueError> {
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable(format!(
                "publish to '{}' rejected",
                topic
            )));
        }

        let partition = partition_for(&record.key, self.inner.partitions);
        let offset = {
            let mut state = self.inner.state.lock().await;
            let log = state
                .logs
                .entry((topic.to_string(), partition))
                .or_default();
            log.push(record.clone());
            log.len() - 1
        };
        self.inner.appended.send_modify(|version| *version += 1);

        debug!(topic = %topic, partition, offset, key = %record.key, "Published record");

        Ok(PublishAck {
            topic: topic.to_string(),
            partition,
            offset: offset.to_string(),
        })
    }

    fn partitions(&self, _topic: &str) -> u32 {
        self.inner.partitions
    }

    fn consume(&self, topic: &str, group: &str, partition: u32) -> BatchStream {
        let inner = self.inner.clone();
        let topic = topic.to_string();
        let group = group.to_string();

        Box::pin(async_stream::stream! {
            let mut appended = inner.appended.subscribe();
            let mut closed = inner.closed.subscribe();
            let mut replay = None;

            loop {
                if *closed.borrow() {
                    break;
                }

                appended.borrow_and_update();
                if let Some(batch) = inner.next_batch(&topic, &group, partition, &mut replay).await {
                    yield Ok(batch);
                    continue;
                }

                tokio::select! {
                    _ = closed.wait_for(|c| *c) => break,
                    _ = appended.changed() => {}
                }
            }

            debug!(topic = %topic, group = %group, partition, "Consumer stream closed");
        })
    }

    async fn commit(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        offsets: &[String],
    ) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;
        let group_state = state
            .groups
            .entry((topic.to_string(), partition, group.to_string()))
            .or_default();

        for offset in offsets {
            let idx: usize = offset
                .parse()
                .map_err(|_| QueueError::Unavailable(format!("invalid offset '{}'", offset)))?;
            group_state.pending.remove(&idx);
        }

        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn record(key: &str) -> DeliveryRecord {
        DeliveryRecord::new(key, key.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let queue = InMemoryQueue::with_partitions(1);
        for key in ["a", "b", "c"] {
            queue.publish("mail", &record(key)).await.unwrap();
        }

        let mut stream = queue.consume("mail", "g", 0);
        let batch = stream.next().await.unwrap().unwrap();

        let keys: Vec<_> = batch.records.iter().map(|r| r.record.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(batch.records[0].offset, "0");
        assert_eq!(queue.pending_count("mail", "g").await, 3);
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        let queue = InMemoryQueue::new(&QueueConfig::new().with_batch_size(2));
        for key in ["a", "b", "c"] {
            queue.publish("mail", &record(key)).await.unwrap();
        }

        let mut stream = queue.consume("mail", "g", 0);
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 2);
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_clears_pending() {
        let queue = InMemoryQueue::with_partitions(1);
        queue.publish("mail", &record("a")).await.unwrap();

        let mut stream = queue.consume("mail", "g", 0);
        let batch = stream.next().await.unwrap().unwrap();
        queue
            .commit("mail", 0, "g", &[batch.records[0].offset.clone()])
            .await
            .unwrap();

        assert_eq!(queue.pending_count("mail", "g").await, 0);
    }

    #[tokio::test]
    async fn test_uncommitted_records_are_redelivered() {
        let queue = InMemoryQueue::with_partitions(1);
        queue.publish("mail", &record("a")).await.unwrap();
        queue.publish("mail", &record("b")).await.unwrap();

        {
            let mut stream = queue.consume("mail", "g", 0);
            let batch = stream.next().await.unwrap().unwrap();
            queue
                .commit("mail", 0, "g", &[batch.records[0].offset.clone()])
                .await
                .unwrap();
        }

        let mut stream = queue.consume("mail", "g", 0);
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].record.key, "b");
    }

    #[tokio::test]
    async fn test_groups_have_independent_cursors() {
        let queue = InMemoryQueue::with_partitions(1);
        queue.publish("mail", &record("a")).await.unwrap();

        let first = queue.consume("mail", "g1", 0).next().await.unwrap().unwrap();
        let second = queue.consume("mail", "g2", 0).next().await.unwrap().unwrap();
        assert_eq!(first.records, second.records);
    }

    #[tokio::test]
    async fn test_parked_consumer_wakes_on_publish() {
        let queue = InMemoryQueue::with_partitions(1);
        let mut stream = queue.consume("mail", "g", 0);

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish("mail", &record("late")).await.unwrap();
        });

        let batch = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("consumer should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(batch.records[0].record.key, "late");
    }

    #[tokio::test]
    async fn test_close_ends_parked_stream() {
        let queue = InMemoryQueue::with_partitions(1);
        let mut stream = queue.consume("mail", "g", 0);

        let closer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("close should unblock the consumer");
        assert!(next.is_none());
        assert!(queue.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let queue = InMemoryQueue::with_partitions(4);
        let first = queue.publish("mail", &record("k")).await.unwrap();
        let second = queue.publish("mail", &record("k")).await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(first.partition, partition_for("k", 4));
        assert_eq!(second.offset, "1");
    }

    #[tokio::test]
    async fn test_failing_publishes() {
        let queue = InMemoryQueue::default();
        queue.fail_publishes(true);
        assert!(queue.publish("mail", &record("a")).await.is_err());

        queue.fail_publishes(false);
        assert!(queue.publish("mail", &record("a")).await.is_ok());
        assert_eq!(queue.records("mail").await.len(), 1);
    }
}
