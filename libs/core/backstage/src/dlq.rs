//! Dead-letter streams.
//!
//! Messages whose delivery count exceeds the configured bound are copied to
//! the dead-letter stream of their priority tier and acknowledged on the
//! original stream. Dead-lettering is terminal: nothing here re-enqueues a
//! task unless an operator explicitly asks for it.

use crate::consumer::ClaimedEntry;
use crate::error::BackstageError;
use crate::keys::KeySpace;
use crate::message::{field_str, now_ms, Priority, TaskMessage};
use crate::metrics;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A dead-lettered task, as returned by the admin listing operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry id on the dead-letter stream.
    pub id: String,
    pub task_name: String,
    pub payload: String,
    pub enqueued_at: i64,
    /// Id the message had on its priority stream.
    pub original_id: String,
    pub delivery_count: u64,
    pub dead_lettered_at: i64,
}

/// Dead-letter stream manager for one keyspace.
#[derive(Clone)]
pub struct DeadLetterQueue {
    redis: ConnectionManager,
    keys: KeySpace,
}

impl DeadLetterQueue {
    pub fn new(redis: ConnectionManager, keys: KeySpace) -> Self {
        Self { redis, keys }
    }

    /// Copy a claimed message to the dead-letter stream of its tier.
    ///
    /// Fields are copied raw so that even a message the broker cannot parse
    /// is preserved for inspection. The caller acknowledges the original.
    pub async fn push(
        &self,
        priority: Priority,
        entry: &ClaimedEntry,
        delivery_count: u64,
    ) -> Result<String, BackstageError> {
        let dl_key = self.keys.dead_letter(priority);

        let task_name = field_str(&entry.fields, "taskName").unwrap_or_default();
        let payload = field_str(&entry.fields, "payload").unwrap_or_else(|| "null".to_string());
        let enqueued_at = field_str(&entry.fields, "enqueuedAt").unwrap_or_else(|| "0".to_string());

        let mut conn = self.redis.clone();
        let id: String = redis::cmd("XADD")
            .arg(&dl_key)
            .arg("*")
            .arg("taskName")
            .arg(&task_name)
            .arg("payload")
            .arg(&payload)
            .arg("enqueuedAt")
            .arg(&enqueued_at)
            .arg("originalId")
            .arg(&entry.id)
            .arg("deliveryCount")
            .arg(delivery_count)
            .arg("deadLetteredAt")
            .arg(now_ms())
            .query_async(&mut conn)
            .await?;

        warn!(
            task = %task_name,
            original_id = %entry.id,
            delivery_count,
            dead_letter = %dl_key,
            "Moved task to dead-letter stream"
        );
        metrics::record_dead_lettered(&dl_key);

        Ok(id)
    }

    /// Number of dead-lettered messages for a tier.
    pub async fn len(&self, priority: Priority) -> Result<i64, BackstageError> {
        let mut conn = self.redis.clone();
        let len: i64 = conn.xlen(self.keys.dead_letter(priority)).await?;
        Ok(len)
    }

    /// List dead-lettered tasks for a tier, oldest-first.
    pub async fn list(
        &self,
        priority: Priority,
        count: usize,
        offset: Option<&str>,
    ) -> Result<Vec<DeadLetterEntry>, BackstageError> {
        let mut conn = self.redis.clone();
        let start = offset.unwrap_or("-");

        let reply: StreamRangeReply = conn
            .xrange_count(self.keys.dead_letter(priority), start, "+", count)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| DeadLetterEntry {
                task_name: field_str(&entry.map, "taskName").unwrap_or_default(),
                payload: field_str(&entry.map, "payload").unwrap_or_else(|| "null".to_string()),
                enqueued_at: field_str(&entry.map, "enqueuedAt")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                original_id: field_str(&entry.map, "originalId").unwrap_or_default(),
                delivery_count: field_str(&entry.map, "deliveryCount")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                dead_lettered_at: field_str(&entry.map, "deadLetteredAt")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                id: entry.id,
            })
            .collect())
    }

    /// Fetch a single dead-letter entry by id.
    pub async fn get(
        &self,
        priority: Priority,
        id: &str,
    ) -> Result<Option<DeadLetterEntry>, BackstageError> {
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = conn
            .xrange(self.keys.dead_letter(priority), id, id)
            .await?;

        Ok(reply.ids.into_iter().next().map(|entry| DeadLetterEntry {
            task_name: field_str(&entry.map, "taskName").unwrap_or_default(),
            payload: field_str(&entry.map, "payload").unwrap_or_else(|| "null".to_string()),
            enqueued_at: field_str(&entry.map, "enqueuedAt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            original_id: field_str(&entry.map, "originalId").unwrap_or_default(),
            delivery_count: field_str(&entry.map, "deliveryCount")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            dead_lettered_at: field_str(&entry.map, "deadLetteredAt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            id: entry.id,
        }))
    }

    /// Delete a dead-letter entry.
    pub async fn delete(&self, priority: Priority, id: &str) -> Result<bool, BackstageError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = conn.xdel(self.keys.dead_letter(priority), &[id]).await?;
        debug!(id = %id, "Deleted dead-letter entry");
        Ok(deleted > 0)
    }

    /// Requeue a dead-lettered task back onto its priority stream with a
    /// fresh enqueue time, then delete the dead-letter entry.
    pub async fn requeue(
        &self,
        priority: Priority,
        id: &str,
    ) -> Result<Option<String>, BackstageError> {
        let Some(entry) = self.get(priority, id).await? else {
            return Ok(None);
        };

        let message = TaskMessage::new(entry.task_name.clone(), entry.payload.clone());
        let stream_key = self.keys.priority_stream(priority);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream_key).arg("*");
        for (field, value) in message.to_fields()? {
            cmd.arg(field).arg(value);
        }

        let mut conn = self.redis.clone();
        let new_id: String = cmd.query_async(&mut conn).await?;
        self.delete(priority, id).await?;

        info!(
            task = %entry.task_name,
            dead_letter_id = %id,
            new_id = %new_id,
            "Requeued dead-lettered task"
        );

        Ok(Some(new_id))
    }

    /// Drop every entry on a tier's dead-letter stream. Returns how many
    /// entries were removed.
    pub async fn purge(&self, priority: Priority) -> Result<i64, BackstageError> {
        let dl_key = self.keys.dead_letter(priority);
        let mut conn = self.redis.clone();

        let len: i64 = conn.xlen(&dl_key).await?;
        if len > 0 {
            let _: () = redis::cmd("XTRIM")
                .arg(&dl_key)
                .arg("MAXLEN")
                .arg(0)
                .query_async(&mut conn)
                .await?;
            info!(count = len, dead_letter = %dl_key, "Purged dead-letter stream");
        }

        Ok(len)
    }
}
