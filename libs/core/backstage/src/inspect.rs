//! Queue introspection and maintenance helpers.

use crate::error::BackstageError;
use crate::keys::KeySpace;
use crate::message::Priority;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;

/// Statistics for a single stream.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    /// Entries currently on the stream.
    pub pending: i64,
    /// Entries on the tier's dead-letter stream (0 for custom queues, which
    /// have none).
    pub dead_letter: i64,
}

/// A point-in-time view of the whole keyspace.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub queues: Vec<QueueStats>,
    /// Delayed tasks waiting in the scheduled set.
    pub scheduled: i64,
    pub total_pending: i64,
    pub total_dead_letter: i64,
}

/// Read-only statistics and purge operations over one keyspace.
#[derive(Clone)]
pub struct Inspector {
    redis: ConnectionManager,
    keys: KeySpace,
}

impl Inspector {
    pub fn new(redis: ConnectionManager, keys: KeySpace) -> Self {
        Self { redis, keys }
    }

    /// Snapshot the priority tiers plus any custom queues.
    pub async fn snapshot(&self, custom_queues: &[String]) -> Result<BrokerSnapshot, BackstageError> {
        let mut conn = self.redis.clone();
        let mut queues = Vec::new();
        let mut total_pending = 0;
        let mut total_dead_letter = 0;

        for priority in Priority::all() {
            let pending: i64 = conn
                .xlen(self.keys.priority_stream(priority))
                .await
                .unwrap_or(0);
            let dead_letter: i64 = conn
                .xlen(self.keys.dead_letter(priority))
                .await
                .unwrap_or(0);

            total_pending += pending;
            total_dead_letter += dead_letter;
            queues.push(QueueStats {
                name: priority.to_string(),
                pending,
                dead_letter,
            });
        }

        for name in custom_queues {
            let pending: i64 = conn.xlen(self.keys.queue_stream(name)).await.unwrap_or(0);
            total_pending += pending;
            queues.push(QueueStats {
                name: name.clone(),
                pending,
                dead_letter: 0,
            });
        }

        let scheduled: i64 = conn.zcard(self.keys.scheduled()).await.unwrap_or(0);

        Ok(BrokerSnapshot {
            queues,
            scheduled,
            total_pending,
            total_dead_letter,
        })
    }

    /// Number of delayed tasks waiting for promotion.
    pub async fn scheduled_count(&self) -> Result<i64, BackstageError> {
        let mut conn = self.redis.clone();
        let count: i64 = conn.zcard(self.keys.scheduled()).await?;
        Ok(count)
    }

    /// Delete a priority stream outright. Removes unprocessed data.
    pub async fn purge_stream(&self, priority: Priority) -> Result<i64, BackstageError> {
        let key = self.keys.priority_stream(priority);
        let mut conn = self.redis.clone();

        let len: i64 = conn.xlen(&key).await?;
        if len > 0 {
            let _: i64 = conn.del(&key).await?;
        }
        Ok(len)
    }

    /// Drop every delayed task. Removes unprocessed data.
    pub async fn purge_scheduled(&self) -> Result<i64, BackstageError> {
        let key = self.keys.scheduled();
        let mut conn = self.redis.clone();

        let len: i64 = conn.zcard(&key).await?;
        if len > 0 {
            let _: i64 = conn.del(&key).await?;
        }
        Ok(len)
    }
}
