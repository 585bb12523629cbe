//! Low-level consumer-group operations.
//!
//! `GroupConsumer` wraps the stream commands the worker loops are built
//! from: idempotent group creation, the priority-ordered group read,
//! acknowledgement, pending-entry scans, and min-idle claims.

use crate::error::{is_busygroup, BackstageError};
use crate::message::TaskMessage;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A message delivered by a group read, with its task parsed.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub stream_key: String,
    pub id: String,
    pub message: TaskMessage,
}

/// A pending-entry-list record: a delivered but unacknowledged message.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    /// Times the entry has been delivered so far.
    pub delivery_count: u64,
}

/// A message claimed from another consumer. Fields stay raw so that even an
/// unparseable message can be copied to the dead-letter stream.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub id: String,
    pub fields: HashMap<String, redis::Value>,
}

impl ClaimedEntry {
    pub fn task(&self) -> Result<TaskMessage, BackstageError> {
        TaskMessage::from_map(&self.fields)
    }
}

/// Consumer-group operations against one Redis connection.
#[derive(Clone)]
pub struct GroupConsumer {
    redis: ConnectionManager,
    group: String,
    consumer: String,
}

impl GroupConsumer {
    pub fn new(
        redis: ConnectionManager,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer
    }

    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// Ensure the consumer group exists on a stream, creating the stream if
    /// needed. Groups start at offset 0 so entries appended before the first
    /// worker came up are still delivered.
    pub async fn ensure_group(&self, stream_key: &str) -> Result<(), BackstageError> {
        let mut conn = self.redis.clone();

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream = %stream_key, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busygroup(&e) => {
                debug!(stream = %stream_key, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BackstageError::ConsumerGroup(e.to_string())),
        }
    }

    /// Group-read new messages from an ordered list of streams.
    ///
    /// The server returns messages from the first stream that has any, which
    /// is what gives urgent entries strict precedence over lower tiers.
    /// Unparseable entries are logged and skipped without acknowledgement so
    /// the reclaimer eventually dead-letters them.
    pub async fn read(
        &self,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BackstageError> {
        let mut conn = self.redis.clone();

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let keys: Vec<&str> = streams.iter().map(String::as_str).collect();
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();

        let result: Result<StreamReadReply, _> =
            conn.xread_options(&keys, &ids, &opts).await;

        match result {
            Ok(reply) => Ok(Self::parse_reply(reply)),
            // BLOCK expiry surfaces as a nil/timeout-shaped error; no
            // messages arrived, which is not a failure.
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("timeout")
                    || err_str.contains("timed out")
                    || err_str.contains("nil")
                    || (err_str.contains("response") && err_str.contains("type"))
                {
                    Ok(vec![])
                } else {
                    Err(BackstageError::Redis(e))
                }
            }
        }
    }

    fn parse_reply(reply: StreamReadReply) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        for stream in reply.keys {
            for entry in stream.ids {
                match TaskMessage::from_map(&entry.map) {
                    Ok(message) => deliveries.push(Delivery {
                        stream_key: stream.key.clone(),
                        id: entry.id,
                        message,
                    }),
                    Err(e) => {
                        warn!(
                            stream = %stream.key,
                            message_id = %entry.id,
                            error = %e,
                            "Skipping unparseable message"
                        );
                    }
                }
            }
        }

        deliveries
    }

    /// Remove a delivered message from the pending entry list.
    pub async fn ack(&self, stream_key: &str, message_id: &str) -> Result<(), BackstageError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.xack(stream_key, &self.group, &[message_id]).await?;
        debug!(stream = %stream_key, message_id = %message_id, "Acknowledged message");
        Ok(())
    }

    /// Fetch pending entries whose idle age is at least `min_idle`,
    /// oldest-first, bounded by `count`.
    pub async fn pending(
        &self,
        stream_key: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BackstageError> {
        let mut conn = self.redis.clone();

        let entries: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                id,
                consumer,
                idle_ms,
                delivery_count,
            })
            .collect())
    }

    /// Claim a pending message into this consumer, guarded by `min_idle`.
    ///
    /// The guard makes concurrent reclaimers safe: a successful claim resets
    /// the entry's idle time, so a racing claim with the same min-idle bound
    /// comes back empty.
    pub async fn claim(
        &self,
        stream_key: &str,
        message_id: &str,
        min_idle: Duration,
    ) -> Result<Option<ClaimedEntry>, BackstageError> {
        let mut conn = self.redis.clone();

        let reply: StreamClaimReply = conn
            .xclaim(
                stream_key,
                &self.group,
                &self.consumer,
                min_idle.as_millis() as usize,
                &[message_id],
            )
            .await?;

        Ok(reply.ids.into_iter().next().map(|entry| ClaimedEntry {
            id: entry.id,
            fields: entry.map,
        }))
    }

    /// Number of entries in a stream.
    pub async fn stream_len(&self, stream_key: &str) -> Result<i64, BackstageError> {
        let mut conn = self.redis.clone();
        let len: i64 = conn.xlen(stream_key).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claimed_entry_parses_task() {
        let mut fields = HashMap::new();
        fields.insert(
            "taskName".to_string(),
            redis::Value::BulkString(b"email.send".to_vec()),
        );
        fields.insert(
            "payload".to_string(),
            redis::Value::BulkString(b"{}".to_vec()),
        );
        fields.insert(
            "enqueuedAt".to_string(),
            redis::Value::BulkString(b"1700000000000".to_vec()),
        );

        let entry = ClaimedEntry {
            id: "1-0".to_string(),
            fields,
        };
        let task = entry.task().unwrap();
        assert_eq!(task.task_name, "email.send");
        assert_eq!(task.enqueued_at, 1_700_000_000_000);
    }

    #[test]
    fn test_claimed_entry_unparseable() {
        let entry = ClaimedEntry {
            id: "1-0".to_string(),
            fields: HashMap::new(),
        };
        assert!(entry.task().is_err());
    }
}
