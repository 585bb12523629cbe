//! Broadcast fan-out.
//!
//! Standard queues deliver each message to exactly one worker. Broadcast
//! messages go to every active worker instead: all workers read the same
//! stream, but each through its own consumer group (`broadcast-<workerId>`),
//! so every group delivers every message once per worker. A stale-group
//! reaper destroys groups left behind by dead workers.

use crate::config::BroadcastConfig;
use crate::consumer::GroupConsumer;
use crate::error::BackstageError;
use crate::handler::TaskError;
use crate::keys::KeySpace;
use crate::message::TaskMessage;
use crate::metrics;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamInfoConsumersReply, StreamInfoGroupsReply};
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Messages fetched per broadcast group read.
const BROADCAST_READ_COUNT: usize = 10;

/// A message from the broadcast stream.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub id: String,
    pub task_name: String,
    /// Serialized payload string (`"null"` when none was supplied).
    pub payload: String,
    pub enqueued_at: i64,
}

impl From<(String, TaskMessage)> for BroadcastMessage {
    fn from((id, message): (String, TaskMessage)) -> Self {
        Self {
            id,
            task_name: message.task_name,
            payload: message.payload,
            enqueued_at: message.enqueued_at,
        }
    }
}

/// Handler invoked for each broadcast message this worker receives.
#[async_trait]
pub trait BroadcastHandler: Send + Sync {
    async fn handle(&self, message: BroadcastMessage) -> Result<(), TaskError>;
}

/// Adapter wrapping an async closure.
pub(crate) struct FnBroadcastHandler<F> {
    f: F,
}

impl<F> FnBroadcastHandler<F> {
    pub(crate) fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> BroadcastHandler for FnBroadcastHandler<F>
where
    F: Fn(BroadcastMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn handle(&self, message: BroadcastMessage) -> Result<(), TaskError> {
        (self.f)(message).await
    }
}

/// Per-worker broadcast listener.
pub struct BroadcastListener {
    consumer: GroupConsumer,
    keys: KeySpace,
    config: BroadcastConfig,
    handler: Option<Arc<dyn BroadcastHandler>>,
}

impl BroadcastListener {
    /// Create a listener for one worker. Each worker gets its own consumer
    /// group so it receives every broadcast message.
    pub fn new(
        redis: ConnectionManager,
        keys: KeySpace,
        worker_id: impl Into<String>,
        config: BroadcastConfig,
    ) -> Self {
        let worker_id = worker_id.into();
        let group = format!("broadcast-{}", worker_id);
        Self {
            consumer: GroupConsumer::new(redis, group, worker_id),
            keys,
            config,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn BroadcastHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// This worker's consumer group name on the broadcast stream.
    pub fn group(&self) -> &str {
        self.consumer.group()
    }

    /// Create this worker's consumer group at offset 0, so a fresh worker
    /// does not observe messages strictly older than its start. Tolerates
    /// the group already existing.
    pub async fn initialize(&self) -> Result<(), BackstageError> {
        self.consumer.ensure_group(&self.keys.broadcast()).await
    }

    /// Append a message to the broadcast stream.
    pub async fn send<P: serde::Serialize>(
        &self,
        task_name: &str,
        payload: &P,
    ) -> Result<String, BackstageError> {
        let message = TaskMessage::new(task_name, serde_json::to_string(payload)?);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.keys.broadcast()).arg("*");
        for (field, value) in message.to_fields()? {
            cmd.arg(field).arg(value);
        }

        let mut conn = self.consumer.redis();
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    /// Group-read new broadcast messages for this worker.
    pub async fn read(&self, block: Duration) -> Result<Vec<BroadcastMessage>, BackstageError> {
        let streams = [self.keys.broadcast()];
        let deliveries = self
            .consumer
            .read(&streams, BROADCAST_READ_COUNT, block)
            .await?;

        Ok(deliveries
            .into_iter()
            .map(|d| BroadcastMessage::from((d.id, d.message)))
            .collect())
    }

    /// Acknowledge a broadcast message within this worker's group.
    pub async fn ack(&self, message_id: &str) -> Result<(), BackstageError> {
        self.consumer.ack(&self.keys.broadcast(), message_id).await
    }

    /// Listen for broadcast messages until shutdown, handling and
    /// acknowledging each, and reaping stale groups on the idle-threshold
    /// cadence.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), BackstageError> {
        self.initialize().await?;
        info!(group = %self.group(), "Broadcast listener started");

        let mut last_cleanup = std::time::Instant::now();

        while !*shutdown.borrow() {
            if last_cleanup.elapsed() >= self.config.consumer_idle_threshold {
                if let Err(e) = self.cleanup().await {
                    warn!(error = %e, "Broadcast cleanup failed");
                }
                last_cleanup = std::time::Instant::now();
            }

            let batch = match self.read(self.config.block_timeout).await {
                Ok(batch) => batch,
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(error = %e, "Broadcast read error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for message in batch {
                let id = message.id.clone();
                if let Some(handler) = &self.handler {
                    if let Err(e) = handler.handle(message).await {
                        warn!(message_id = %id, error = %e, "Broadcast handler error");
                        continue;
                    }
                }
                metrics::record_broadcast_delivered();
                if let Err(e) = self.ack(&id).await {
                    warn!(message_id = %id, error = %e, "Broadcast ACK failed");
                }
            }
        }

        info!(group = %self.group(), "Broadcast listener stopped");
        Ok(())
    }

    /// Destroy stale consumer groups on the broadcast stream.
    ///
    /// A group is stale when it has no consumers at all, or when every
    /// consumer has been idle at least the configured threshold. This
    /// worker's own group is never destroyed. Returns the number of groups
    /// removed.
    pub async fn cleanup(&self) -> Result<usize, BackstageError> {
        let stream_key = self.keys.broadcast();
        let mut conn = self.consumer.redis();

        let groups: StreamInfoGroupsReply = match conn.xinfo_groups(&stream_key).await {
            Ok(groups) => groups,
            // Stream not created yet: nothing to reap.
            Err(e) if e.to_string().contains("no such key") => return Ok(0),
            Err(e) => return Err(BackstageError::Redis(e)),
        };

        let mut deleted = 0;

        for group in groups.groups {
            if group.name == self.group() {
                continue;
            }

            if self.is_group_stale(&group.name).await? {
                let destroyed: i64 = conn.xgroup_destroy(&stream_key, &group.name).await?;
                if destroyed > 0 {
                    info!(group = %group.name, "Deleted stale broadcast group");
                    deleted += 1;
                }
            }
        }

        Ok(deleted)
    }

    /// Whether every consumer of a group is a ghost.
    async fn is_group_stale(&self, group_name: &str) -> Result<bool, BackstageError> {
        let mut conn = self.consumer.redis();

        let reply: StreamInfoConsumersReply = match conn
            .xinfo_consumers(self.keys.broadcast(), group_name)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!(group = %group_name, error = %e, "Consumer listing failed");
                return Ok(false);
            }
        };

        if reply.consumers.is_empty() {
            return Ok(true);
        }

        let threshold_ms = self.config.consumer_idle_threshold.as_millis() as usize;
        Ok(reply.consumers.iter().all(|c| c.idle >= threshold_ms))
    }
}
