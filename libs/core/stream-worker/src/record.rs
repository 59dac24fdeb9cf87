//! Records as they travel through the queue.

use crate::queue::Lease;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The unit handed between producers and consumers.
///
/// `value` is opaque to the queue; it is never re-encoded on retry, so a
/// requeued copy carries the exact bytes that were first published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub key: String,
    pub value: Vec<u8>,
    /// Failed delivery attempts so far (0 on first publish).
    pub attempt: u32,
    /// Reason of the most recent failure.
    pub last_error: Option<String>,
    /// Unix time in milliseconds before which the record must not be processed.
    pub not_before: Option<u64>,
}

impl DeliveryRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            attempt: 0,
            last_error: None,
            not_before: None,
        }
    }

    /// Copy for the next attempt: same key and bytes, counter bumped.
    pub fn next_attempt(&self, reason: impl Into<String>) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            attempt: self.attempt.saturating_add(1),
            last_error: Some(reason.into()),
            not_before: None,
        }
    }

    /// Hold the record back until `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.not_before = Some(now_ms().saturating_add(delay_ms));
        self
    }

    /// Time left until the record is due, zero when it already is.
    pub fn due_in(&self, now_ms: u64) -> Duration {
        self.not_before
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms)))
            .unwrap_or_default()
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// A record together with the queue position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub offset: String,
    pub record: DeliveryRecord,
}

/// Ordered records of a single topic partition.
#[derive(Debug, Clone)]
pub struct Batch {
    pub topic: String,
    pub partition: u32,
    pub records: Vec<ConsumedRecord>,
    /// Ownership of the partition, for backends that lease partitions.
    pub lease: Option<Lease>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// False once the consumer that read this batch lost the partition.
    pub fn is_owned(&self) -> bool {
        self.lease.as_ref().is_none_or(Lease::is_held)
    }

    /// Time until every record in the batch is due.
    pub fn due_in(&self, now_ms: u64) -> Duration {
        self.records
            .iter()
            .map(|c| c.record.due_in(now_ms))
            .max()
            .unwrap_or_default()
    }
}

/// Where a published record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
}

/// Partition for `key` among `partitions` (FNV-1a, stable across processes).
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    if partitions <= 1 {
        return 0;
    }

    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(PRIME));
    hash % partitions
}
