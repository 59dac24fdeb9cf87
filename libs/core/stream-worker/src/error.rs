//! Queue error types and error categorization
//!
//! Categories decide what a caller does with a failure:
//! - **Transient**: may succeed later, retry (republish, back off, or 5xx)
//! - **Permanent**: will never succeed, do not retry

use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

impl ErrorCategory {
    const BASE_DELAY_MS: u64 = 1000;
    const MAX_DELAY_MS: u64 = 30_000;

    /// Exponential backoff for the given consecutive failure count (1s .. 30s).
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        if *self == ErrorCategory::Permanent {
            return 0;
        }

        exponential_backoff_ms(Self::BASE_DELAY_MS, Self::MAX_DELAY_MS, retry_count)
    }
}

/// `base * 2^retry_count`, capped at `max`.
pub fn exponential_backoff_ms(base: u64, max: u64, retry_count: u32) -> u64 {
    base.saturating_mul(2u64.saturating_pow(retry_count)).min(max)
}

/// Queue client errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The write landed on the primary but too few replicas acknowledged it
    #[error("Replication ack timed out: {acked} of {required} replicas")]
    Replication { acked: i64, required: u32 },

    /// Broker rejected or could not take the operation
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Another consumer owns the partition now; the operation was not applied
    #[error("Partition lease lost: {0}")]
    LeaseLost(String),

    /// Client was closed
    #[error("Queue client closed")]
    Closed,
}

impl QueueError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Redis(_) => ErrorCategory::Transient,
            QueueError::Replication { .. } => ErrorCategory::Transient,
            QueueError::Unavailable(_) => ErrorCategory::Transient,
            QueueError::LeaseLost(_) => ErrorCategory::Transient,
            QueueError::Closed => ErrorCategory::Permanent,
        }
    }

    /// Consumer group vanished (stream deleted or flushed)
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, QueueError::Redis(e) if e.to_string().contains("NOGROUP"))
    }
}
