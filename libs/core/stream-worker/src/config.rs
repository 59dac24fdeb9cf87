//! Queue and worker configuration
//!
//! `QueueConfig` tunes a queue backend, `WorkerConfig` says which topics the
//! batch processor reads and where failures go. Both load from `QUEUE_*`
//! environment variables.

use crate::error::exponential_backoff_ms;
use core_config::{env_or_default, env_parse, env_parse_opt, ConfigError, FromEnv};
use std::time::Duration;
use uuid::Uuid;

/// Backend tuning shared by producers and consumers
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Partitions per topic
    pub partitions: u32,

    /// Maximum records per consumed batch
    pub batch_size: usize,

    /// Poll interval in milliseconds when a partition is empty
    pub poll_interval_ms: u64,

    /// Idle time after which another consumer's pending records are claimed
    pub claim_timeout_ms: u64,

    /// Partition lease TTL in milliseconds
    pub lease_ttl_ms: u64,

    /// Approximate cap per partition stream (MAXLEN ~). None keeps every
    /// entry; a cap can trim records nobody has consumed yet.
    pub max_length: Option<u64>,

    /// Replicas that must acknowledge a publish (None = primary only)
    pub min_replicas: Option<u32>,

    /// How long to wait for replica acknowledgement
    pub replica_timeout_ms: u64,

    /// Unique consumer ID within a group (auto-generated if not provided)
    pub consumer_id: String,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self {
            partitions: 1,
            batch_size: 10,
            poll_interval_ms: 500,
            claim_timeout_ms: 30_000,
            lease_ttl_ms: 10_000,
            max_length: None,
            min_replicas: None,
            replica_timeout_ms: 1000,
            consumer_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    pub fn with_claim_timeout_ms(mut self, timeout: u64) -> Self {
        self.claim_timeout_ms = timeout;
        self
    }

    pub fn with_lease_ttl_ms(mut self, ttl: u64) -> Self {
        self.lease_ttl_ms = ttl;
        self
    }

    pub fn with_max_length(mut self, max_length: Option<u64>) -> Self {
        self.max_length = max_length.filter(|n| *n > 0);
        self
    }

    pub fn with_min_replicas(mut self, replicas: Option<u32>) -> Self {
        self.min_replicas = replicas.filter(|n| *n > 0);
        self
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FromEnv for QueueConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();

        let mut config = Self {
            partitions: env_parse("QUEUE_PARTITIONS", defaults.partitions)?,
            batch_size: env_parse("QUEUE_BATCH_SIZE", defaults.batch_size)?,
            poll_interval_ms: env_parse("QUEUE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            claim_timeout_ms: env_parse("QUEUE_CLAIM_TIMEOUT_MS", defaults.claim_timeout_ms)?,
            lease_ttl_ms: env_parse("QUEUE_LEASE_TTL_MS", defaults.lease_ttl_ms)?,
            max_length: None,
            min_replicas: None,
            replica_timeout_ms: env_parse(
                "QUEUE_REPLICA_TIMEOUT_MS",
                defaults.replica_timeout_ms,
            )?,
            consumer_id: env_or_default("QUEUE_CONSUMER_ID", &defaults.consumer_id),
        }
        .with_max_length(env_parse_opt("QUEUE_MAX_LENGTH")?)
        .with_min_replicas(env_parse_opt("QUEUE_MIN_REPLICAS")?);

        config.partitions = config.partitions.max(1);
        config.batch_size = config.batch_size.max(1);
        Ok(config)
    }
}

/// Topics and retry policy for the batch processor
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Topic ingestion publishes to
    pub inbound_topic: String,

    /// Topic failed records are republished to
    pub retry_topic: String,

    /// Terminal topic for records that exhausted retries or can never succeed
    pub dead_letter_topic: String,

    /// Consumer group name
    pub consumer_group: String,

    /// A record whose next attempt would reach this count is dead-lettered
    pub max_attempts: u32,

    /// Delay before the first retry, doubled on every further attempt
    pub retry_base_delay: Duration,

    /// Upper bound of the retry delay
    pub retry_max_delay: Duration,
}

impl WorkerConfig {
    pub fn new(inbound_topic: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        let inbound_topic = inbound_topic.into();
        Self {
            retry_topic: format!("{}-retry", inbound_topic),
            dead_letter_topic: format!("{}-dead-letter", inbound_topic),
            inbound_topic,
            consumer_group: consumer_group.into(),
            max_attempts: 10,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }

    pub fn with_retry_topic(mut self, topic: impl Into<String>) -> Self {
        self.retry_topic = topic.into();
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = topic.into();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max.max(base);
        self
    }

    /// How long a record waits on the retry topic before `attempt` runs.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = u64::try_from(self.retry_base_delay.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.retry_max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(exponential_backoff_ms(
            base,
            max,
            attempt.saturating_sub(1),
        ))
    }

    /// Topics the processor consumes: inbound, then retry (deduplicated)
    pub fn consumed_topics(&self) -> Vec<String> {
        let mut topics = vec![self.inbound_topic.clone()];
        if self.retry_topic != self.inbound_topic {
            topics.push(self.retry_topic.clone());
        }
        topics
    }
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let config = Self::new(
            env_or_default("QUEUE_INBOUND_TOPIC", "mail"),
            env_or_default("QUEUE_CONSUMER_GROUP", "mail-processor"),
        )
        .with_retry_topic(env_or_default("QUEUE_RETRY_TOPIC", "mail-worker-queue"))
        .with_dead_letter_topic(env_or_default("QUEUE_DEAD_LETTER_TOPIC", "mail-dead-letter"))
        .with_max_attempts(env_parse("QUEUE_MAX_ATTEMPTS", 10)?)
        .with_retry_delay(
            Duration::from_millis(env_parse("QUEUE_RETRY_BASE_DELAY_MS", 1000)?),
            Duration::from_millis(env_parse("QUEUE_RETRY_MAX_DELAY_MS", 30_000)?),
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE_VARS: [&str; 17] = [
        "QUEUE_PARTITIONS",
        "QUEUE_BATCH_SIZE",
        "QUEUE_POLL_INTERVAL_MS",
        "QUEUE_CLAIM_TIMEOUT_MS",
        "QUEUE_LEASE_TTL_MS",
        "QUEUE_MAX_LENGTH",
        "QUEUE_MIN_REPLICAS",
        "QUEUE_REPLICA_TIMEOUT_MS",
        "QUEUE_CONSUMER_ID",
        "QUEUE_INBOUND_TOPIC",
        "QUEUE_RETRY_TOPIC",
        "QUEUE_DEAD_LETTER_TOPIC",
        "QUEUE_CONSUMER_GROUP",
        "QUEUE_MAX_ATTEMPTS",
        "QUEUE_RETRY_BASE_DELAY_MS",
        "QUEUE_RETRY_MAX_DELAY_MS",
        "APP_ENV",
    ];

    fn unset_all() -> Vec<(&'static str, Option<&'static str>)> {
        QUEUE_VARS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn test_worker_config_defaults() {
        temp_env::with_vars(unset_all(), || {
            let config = WorkerConfig::from_env().unwrap();
            assert_eq!(config.inbound_topic, "mail");
            assert_eq!(config.retry_topic, "mail-worker-queue");
            assert_eq!(config.dead_letter_topic, "mail-dead-letter");
            assert_eq!(config.consumer_group, "mail-processor");
            assert_eq!(config.max_attempts, 10);
            assert_eq!(config.retry_base_delay, Duration::from_secs(1));
            assert_eq!(config.retry_max_delay, Duration::from_secs(30));
            assert_eq!(config.consumed_topics(), vec!["mail", "mail-worker-queue"]);
        });
    }

    #[test]
    fn test_queue_config_defaults() {
        temp_env::with_vars(unset_all(), || {
            let config = QueueConfig::from_env().unwrap();
            assert_eq!(config.partitions, 1);
            assert_eq!(config.batch_size, 10);
            assert_eq!(config.min_replicas, None);
            assert_eq!(config.max_length, None);
            assert!(config.consumer_id.starts_with("worker-"));
        });
    }

    #[test]
    fn test_queue_config_overrides() {
        temp_env::with_vars(
            [
                ("QUEUE_PARTITIONS", Some("0")),
                ("QUEUE_MIN_REPLICAS", Some("2")),
                ("QUEUE_CONSUMER_ID", Some("worker-a")),
                ("QUEUE_MAX_LENGTH", Some("50000")),
            ],
            || {
                let config = QueueConfig::from_env().unwrap();
                assert_eq!(config.partitions, 1);
                assert_eq!(config.min_replicas, Some(2));
                assert_eq!(config.max_length, Some(50_000));
                assert_eq!(config.consumer_id, "worker-a");
            },
        );
    }

    #[test]
    fn test_invalid_number_names_variable() {
        temp_env::with_var("QUEUE_MAX_ATTEMPTS", Some("lots"), || {
            let err = WorkerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_MAX_ATTEMPTS"));
        });
    }

    #[test]
    fn test_consumed_topics_deduplicates() {
        let config = WorkerConfig::new("mail", "g").with_retry_topic("mail");
        assert_eq!(config.consumed_topics(), vec!["mail"]);
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("orders", "billing").with_max_attempts(0);
        assert_eq!(config.retry_topic, "orders-retry");
        assert_eq!(config.dead_letter_topic, "orders-dead-letter");
        assert_eq!(config.max_attempts, 1);

        let queue = QueueConfig::new()
            .with_partitions(4)
            .with_batch_size(0)
            .with_min_replicas(Some(0));
        assert_eq!(queue.partitions, 4);
        assert_eq!(queue.batch_size, 1);
        assert_eq!(queue.min_replicas, None);
        assert_eq!(QueueConfig::new().with_max_length(Some(0)).max_length, None);
    }

    #[test]
    fn test_retry_delay_grows_per_attempt() {
        let config = WorkerConfig::new("mail", "g")
            .with_retry_delay(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(400));
        assert_eq!(config.retry_delay(4), Duration::from_millis(500));
        assert_eq!(config.retry_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_delay_from_env() {
        temp_env::with_vars(
            [
                ("QUEUE_RETRY_BASE_DELAY_MS", Some("250")),
                ("QUEUE_RETRY_MAX_DELAY_MS", Some("100")),
            ],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.retry_base_delay, Duration::from_millis(250));
                // max never below base
                assert_eq!(config.retry_max_delay, Duration::from_millis(250));
                assert_eq!(config.retry_delay(5), Duration::from_millis(250));
            },
        );
    }
}
