//! Redis Streams queue backend
//!
//! A topic `t` with `n` partitions is the set of streams `t:0 .. t:{n-1}`.
//! Each partition stream has one consumer group per logical group, and a
//! lease key (`t:{p}:lease:{group}`) makes sure only one instance of the group
//! reads the partition at a time. The owner renews the lease in the background
//! every third of its TTL, also while a yielded batch is being processed, and
//! acknowledges only while it still holds the lease. Entries left pending by
//! a crashed instance are claimed once they have been idle for
//! `claim_timeout_ms` and replayed.

use super::{BatchStream, Heartbeat, QueueClient};
use crate::config::QueueConfig;
use crate::error::{ErrorCategory, QueueError};
use crate::record::{partition_for, Batch, ConsumedRecord, DeliveryRecord, PublishAck};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Field/value pairs of a stream entry. `None` when the entry was trimmed.
type Fields = Vec<(String, Vec<u8>)>;
type StreamEntries = Vec<(String, Option<Fields>)>;
type ReadReply = Vec<(String, StreamEntries)>;

const CONNECT_RETRIES: u32 = 5;

/// Take the lease if free, renew it if we hold it.
const ACQUIRE_LEASE: &str = r"
local owner = redis.call('GET', KEYS[1])
if owner == false then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
elseif owner == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

const RELEASE_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// XACK only while we hold the lease; -1 otherwise.
const ACK_IF_OWNER: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return -1
end
return redis.call('XACK', KEYS[2], ARGV[2], unpack(ARGV, 3))
";

/// Queue client backed by Redis Streams
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    config: Arc<QueueConfig>,
    closed: Arc<watch::Sender<bool>>,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, config: QueueConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            conn,
            config: Arc::new(config),
            closed: Arc::new(closed),
        }
    }

    /// Connect with exponential backoff, then verify with PING.
    ///
    /// The ConnectionManager reconnects on its own afterwards.
    pub async fn connect(url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        info!("Connecting to Redis at {}", url);
        let client = redis::Client::open(url)?;

        let mut attempt = 0;
        let conn = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(e) if attempt < CONNECT_RETRIES => {
                    let delay = ErrorCategory::Transient.backoff_delay_ms(attempt);
                    warn!(error = %e, attempt, delay_ms = delay, "Redis connection failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        };

        let queue = Self::new(conn, config);
        queue.ping().await?;
        info!("Successfully connected to Redis");
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn stream_key(topic: &str, partition: u32) -> String {
        format!("{}:{}", topic, partition)
    }

    fn lease_key(topic: &str, group: &str, partition: u32) -> String {
        format!("{}:{}:lease:{}", topic, partition, group)
    }

    /// Create the consumer group if it doesn't exist
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    async fn acquire_lease(&self, lease_key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let acquired: i32 = Script::new(ACQUIRE_LEASE)
            .key(lease_key)
            .arg(&self.config.consumer_id)
            .arg(self.config.lease_ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lease(&self, lease_key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i32 = Script::new(RELEASE_LEASE)
            .key(lease_key)
            .arg(&self.config.consumer_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Take over entries left pending for too long, including our own.
    ///
    /// Returns how many entries were claimed; they are replayed next.
    async fn claim_stale(&self, stream: &str, group: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();

        let pending: Vec<(String, String, i64, i64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(self.config.batch_size * 10)
            .query_async(&mut conn)
            .await?;

        let claim_ids: Vec<&str> = pending
            .iter()
            .filter(|(_, _, idle, _)| *idle >= self.config.claim_timeout_ms as i64)
            .map(|(id, _, _, _)| id.as_str())
            .collect();

        if claim_ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(&self.config.consumer_id)
            .arg(self.config.claim_timeout_ms);
        for id in &claim_ids {
            cmd.arg(*id);
        }
        cmd.arg("JUSTID");

        let claimed: Vec<String> = cmd.query_async(&mut conn).await?;
        if !claimed.is_empty() {
            warn!(stream = %stream, count = claimed.len(), "Claimed abandoned records");
        }

        Ok(claimed.len())
    }

    /// XREADGROUP from `from`: `>` for new entries, an id for our own pending ones.
    ///
    /// Returns the records and the last entry id seen. Pending entries whose
    /// content was trimmed away are acknowledged and reported as lost instead
    /// of being handed to the processor.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        from: &str,
    ) -> Result<(Vec<ConsumedRecord>, Option<String>), QueueError> {
        let mut conn = self.conn.clone();

        let reply: Option<ReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(&self.config.consumer_id)
            .arg("COUNT")
            .arg(self.config.batch_size)
            .arg("STREAMS")
            .arg(stream)
            .arg(from)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::new();
        let mut trimmed = Vec::new();
        let mut last_seen = None;
        for (id, fields) in reply.unwrap_or_default().into_iter().flat_map(|(_, e)| e) {
            last_seen = Some(id.clone());
            match parse_entry(id.clone(), fields) {
                Some(record) => records.push(record),
                None => trimmed.push(id),
            }
        }

        if !trimmed.is_empty() {
            error!(
                stream = %stream,
                count = trimmed.len(),
                ids = ?trimmed,
                "Pending records were trimmed from the stream before delivery, records lost"
            );
            let _: i64 = redis::cmd("XACK")
                .arg(stream)
                .arg(group)
                .arg(&trimmed)
                .query_async(&mut conn)
                .await?;
        }

        Ok((records, last_seen))
    }
}

/// Build a record from stream fields, `None` when the entry was trimmed.
///
/// Entries missing `value` become empty records so the processor can reject
/// them through the normal dead-letter path.
fn parse_entry(id: String, fields: Option<Fields>) -> Option<ConsumedRecord> {
    let fields = fields?;
    let field = |name: &str| fields.iter().find(|(k, _)| k == name).map(|(_, v)| v);
    let text = |v: &Vec<u8>| String::from_utf8_lossy(v).into_owned();

    let value = match field("value") {
        Some(v) => v.clone(),
        None => {
            warn!(stream_id = %id, "Entry has no 'value' field");
            Vec::new()
        }
    };

    let record = DeliveryRecord {
        key: field("key").map(text).unwrap_or_else(|| id.clone()),
        value,
        attempt: field("attempt")
            .and_then(|v| std::str::from_utf8(v).ok()?.parse().ok())
            .unwrap_or(0),
        last_error: field("error").map(text),
        not_before: field("not_before")
            .and_then(|v| std::str::from_utf8(v).ok()?.parse().ok()),
    };

    Some(ConsumedRecord { offset: id, record })
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn publish(
        &self,
        topic: &str,
        record: &DeliveryRecord,
    ) -> Result<PublishAck, QueueError> {
        let mut conn = self.conn.clone();
        let partition = partition_for(&record.key, self.config.partitions);
        let stream = Self::stream_key(topic, partition);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream);
        if let Some(max_length) = self.config.max_length {
            cmd.arg("MAXLEN").arg("~").arg(max_length);
        }
        cmd.arg("*")
            .arg("key")
            .arg(&record.key)
            .arg("value")
            .arg(record.value.as_slice())
            .arg("attempt")
            .arg(record.attempt);
        if let Some(error) = &record.last_error {
            cmd.arg("error").arg(error);
        }
        if let Some(not_before) = record.not_before {
            cmd.arg("not_before").arg(not_before);
        }

        let stream_id: String = cmd.query_async(&mut conn).await?;

        if let Some(required) = self.config.min_replicas {
            let acked: i64 = redis::cmd("WAIT")
                .arg(required)
                .arg(self.config.replica_timeout_ms)
                .query_async(&mut conn)
                .await?;
            if acked < i64::from(required) {
                return Err(QueueError::Replication { acked, required });
            }
        }

        debug!(stream = %stream, stream_id = %stream_id, key = %record.key, "Published record");

        Ok(PublishAck {
            topic: topic.to_string(),
            partition,
            offset: stream_id,
        })
    }

    fn partitions(&self, _topic: &str) -> u32 {
        self.config.partitions
    }

    fn consume(&self, topic: &str, group: &str, partition: u32) -> BatchStream {
        let this = self.clone();
        let topic = topic.to_string();
        let group = group.to_string();
        let stream_key = Self::stream_key(&topic, partition);
        let lease_key = Self::lease_key(&topic, &group, partition);

        Box::pin(async_stream::stream! {
            let mut closed = this.closed.subscribe();
            let poll_interval = Duration::from_millis(this.config.poll_interval_ms);
            let lease_ttl = Duration::from_millis(this.config.lease_ttl_ms);
            let lease_wait = Duration::from_millis((this.config.lease_ttl_ms / 2).max(100));
            let renew_interval = Duration::from_millis((this.config.lease_ttl_ms / 3).max(1));
            let claim_interval = Duration::from_millis(this.config.claim_timeout_ms.max(1000));

            let mut group_ready = false;
            // Some while we own the partition
            let mut heartbeat: Option<Heartbeat> = None;
            let mut last_claim: Option<Instant> = None;
            // Some(id): replaying our own pending entries after `id`
            let mut replay_from: Option<String> = None;

            loop {
                if *closed.borrow() {
                    break;
                }

                if !group_ready {
                    match this.ensure_group(&stream_key, &group).await {
                        Ok(()) => group_ready = true,
                        Err(e) => {
                            yield Err(e);
                            continue;
                        }
                    }
                }

                if heartbeat.as_ref().is_some_and(|h| !h.is_held()) {
                    warn!(stream = %stream_key, group = %group, "Lost partition lease");
                    heartbeat = None;
                }

                match this.acquire_lease(&lease_key).await {
                    Ok(true) => {
                        if heartbeat.is_none() {
                            info!(stream = %stream_key, group = %group, "Acquired partition lease");
                            let renewer = this.clone();
                            let key = lease_key.clone();
                            heartbeat = Some(Heartbeat::spawn(renew_interval, lease_ttl, move || {
                                let renewer = renewer.clone();
                                let key = key.clone();
                                async move { renewer.acquire_lease(&key).await }
                            }));
                            last_claim = None;
                            replay_from = Some("0".to_string());
                        }
                    }
                    Ok(false) => {
                        if heartbeat.take().is_some() {
                            warn!(stream = %stream_key, group = %group, "Lost partition lease");
                        }
                        tokio::select! {
                            _ = closed.wait_for(|c| *c) => break,
                            _ = tokio::time::sleep(lease_wait) => {}
                        }
                        continue;
                    }
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                }

                if last_claim.is_none_or(|at| at.elapsed() >= claim_interval) {
                    match this.claim_stale(&stream_key, &group).await {
                        Ok(claimed) => {
                            if claimed > 0 && replay_from.is_none() {
                                replay_from = Some("0".to_string());
                            }
                            last_claim = Some(Instant::now());
                        }
                        Err(e) => {
                            yield Err(e);
                            continue;
                        }
                    }
                }

                let replaying = replay_from.is_some();
                let from = replay_from.as_deref().unwrap_or(">");
                match this.read(&stream_key, &group, from).await {
                    Ok((records, last_seen)) if records.is_empty() => {
                        if replaying {
                            // None once the pending list is exhausted
                            replay_from = last_seen;
                            continue;
                        }
                        tokio::select! {
                            _ = closed.wait_for(|c| *c) => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Ok((records, last_seen)) => {
                        if replaying {
                            replay_from = last_seen;
                        }
                        yield Ok(Batch {
                            topic: topic.clone(),
                            partition,
                            records,
                            lease: heartbeat.as_ref().map(Heartbeat::lease),
                        });
                    }
                    Err(e) => {
                        if e.is_nogroup_error() {
                            group_ready = false;
                        }
                        yield Err(e);
                    }
                }
            }

            if heartbeat.take().is_some() {
                if let Err(e) = this.release_lease(&lease_key).await {
                    debug!(error = %e, "Failed to release partition lease");
                }
            }
            debug!(stream = %stream_key, group = %group, "Consumer stream closed");
        })
    }

    async fn commit(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        offsets: &[String],
    ) -> Result<(), QueueError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let stream = Self::stream_key(topic, partition);

        let acked: i64 = Script::new(ACK_IF_OWNER)
            .key(Self::lease_key(topic, group, partition))
            .key(&stream)
            .arg(&self.config.consumer_id)
            .arg(group)
            .arg(offsets)
            .invoke_async(&mut conn)
            .await?;

        if acked < 0 {
            return Err(QueueError::LeaseLost(stream));
        }

        debug!(stream = %stream, acked, "Committed records");
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response != "PONG" {
            return Err(QueueError::Unavailable(format!(
                "unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
