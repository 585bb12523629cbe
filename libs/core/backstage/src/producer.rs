//! Task producer.
//!
//! Appends tasks to priority streams, routes delayed tasks into the
//! scheduled sorted set, fans messages out over the broadcast stream, and
//! enforces the deduplication guard.

use crate::error::BackstageError;
use crate::keys::KeySpace;
use crate::message::{now_ms, BackoffPolicy, Priority, ScheduledTask, TaskMessage};
use crate::metrics;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Deduplication settings for a single enqueue.
#[derive(Debug, Clone)]
pub struct Dedupe {
    /// Unique key for this job instance.
    pub key: String,
    /// Deduplication window (default: 1 hour).
    pub ttl: Duration,
}

impl Dedupe {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Options for enqueueing a task.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority tier. Defaults to `Priority::Default`.
    pub priority: Option<Priority>,
    /// Custom queue name. If set, it overrides `priority`.
    pub queue: Option<String>,
    /// Delay before the task becomes runnable, in milliseconds. A non-zero
    /// value routes the task through the scheduled set; a past-due value is
    /// picked up by the next promoter tick.
    pub delay: Option<i64>,
    /// Deduplication guard for this enqueue.
    pub dedupe: Option<Dedupe>,
    /// Maximum number of delivery attempts before dead-lettering.
    pub attempts: Option<u32>,
    /// Retry backoff policy.
    pub backoff: Option<BackoffPolicy>,
    /// Handler execution budget.
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay.as_millis() as i64);
        self
    }

    /// Set the delay in raw milliseconds. Negative values schedule the task
    /// in the past, making it due on the next promoter tick.
    pub fn with_delay_ms(mut self, delay: i64) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dedupe(mut self, dedupe: Dedupe) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of an enqueue operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to a stream; carries the server-assigned message id.
    Enqueued(String),
    /// Routed to the scheduled set; due at `execute_at` (epoch millis).
    Scheduled { execute_at: i64 },
    /// Rejected by the dedup guard. Expected behavior, not an error.
    Deduplicated,
}

impl EnqueueOutcome {
    /// The message id, or the synthetic `scheduled:<ms>` id for delayed
    /// tasks. `None` when the enqueue was deduplicated.
    pub fn id(&self) -> Option<String> {
        match self {
            Self::Enqueued(id) => Some(id.clone()),
            Self::Scheduled { execute_at } => Some(format!("scheduled:{}", execute_at)),
            Self::Deduplicated => None,
        }
    }

    pub fn is_deduplicated(&self) -> bool {
        matches!(self, Self::Deduplicated)
    }
}

/// Task producer. Cheap to clone; shares the managed connection.
#[derive(Clone)]
pub struct Producer {
    redis: ConnectionManager,
    keys: KeySpace,
}

impl Producer {
    pub fn new(redis: ConnectionManager, keys: KeySpace) -> Self {
        Self { redis, keys }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Enqueue a task.
    ///
    /// Supports priority tiers, custom queues, delayed scheduling,
    /// deduplication, and execution metadata (attempts, backoff, timeout).
    pub async fn enqueue<P: Serialize>(
        &self,
        task_name: &str,
        payload: &P,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, BackstageError> {
        if let Some(dedupe) = &opts.dedupe {
            if !self.try_acquire_dedupe(dedupe).await? {
                debug!(task = %task_name, dedupe_key = %dedupe.key, "Enqueue deduplicated");
                metrics::record_deduplicated(task_name);
                return Ok(EnqueueOutcome::Deduplicated);
            }
        }

        let stream_key = match &opts.queue {
            Some(queue) => self.keys.queue_stream(queue),
            None => self
                .keys
                .priority_stream(opts.priority.unwrap_or_default()),
        };

        let payload = serde_json::to_string(payload)?;
        let enqueued_at = now_ms();

        if let Some(delay) = opts.delay.filter(|d| *d != 0) {
            let execute_at = enqueued_at + delay;
            let member = ScheduledTask {
                task_name: task_name.to_string(),
                payload,
                enqueued_at,
                stream_key: Some(stream_key),
                priority: opts.priority,
                attempts: opts.attempts,
                backoff: opts.backoff,
                timeout: opts.timeout.map(|t| t.as_millis() as i64),
            };
            let data = serde_json::to_string(&member)?;

            let mut conn = self.redis.clone();
            let _: i64 = redis::cmd("ZADD")
                .arg(self.keys.scheduled())
                .arg(execute_at)
                .arg(&data)
                .query_async(&mut conn)
                .await?;

            debug!(task = %task_name, execute_at, "Scheduled delayed task");
            metrics::record_enqueued(&self.keys.scheduled());
            return Ok(EnqueueOutcome::Scheduled { execute_at });
        }

        let mut message = TaskMessage::new(task_name, payload);
        message.enqueued_at = enqueued_at;
        message.attempts = opts.attempts;
        message.backoff = opts.backoff;
        message.timeout = opts.timeout.map(|t| t.as_millis() as i64);

        let id = self.append(&stream_key, &message).await?;

        debug!(task = %task_name, stream = %stream_key, message_id = %id, "Enqueued task");
        metrics::record_enqueued(&stream_key);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    /// Enqueue a task to run after a delay. Convenience wrapper around
    /// `enqueue` with the delay option set.
    pub async fn schedule<P: Serialize>(
        &self,
        task_name: &str,
        payload: &P,
        delay: Duration,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, BackstageError> {
        self.enqueue(task_name, payload, opts.with_delay(delay)).await
    }

    /// Send a task to all workers via the broadcast stream.
    ///
    /// Never deduplicated, never delayed; every active worker receives a
    /// copy through its own consumer group.
    pub async fn broadcast<P: Serialize>(
        &self,
        task_name: &str,
        payload: &P,
    ) -> Result<String, BackstageError> {
        let message = TaskMessage::new(task_name, serde_json::to_string(payload)?);
        let stream_key = self.keys.broadcast();
        let id = self.append(&stream_key, &message).await?;

        debug!(task = %task_name, message_id = %id, "Broadcast task");
        metrics::record_enqueued(&stream_key);
        Ok(id)
    }

    /// XADD a message with its fields in canonical order.
    pub(crate) async fn append(
        &self,
        stream_key: &str,
        message: &TaskMessage,
    ) -> Result<String, BackstageError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key).arg("*");
        for (field, value) in message.to_fields()? {
            cmd.arg(field).arg(value);
        }

        let mut conn = self.redis.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    /// Atomically set the dedup guard key. Returns false when the key
    /// already exists within its TTL window.
    async fn try_acquire_dedupe(&self, dedupe: &Dedupe) -> Result<bool, BackstageError> {
        let key = self.keys.dedupe(&dedupe.key);
        let ttl = if dedupe.ttl.is_zero() {
            Duration::from_secs(3600)
        } else {
            dedupe.ttl
        };

        let mut conn = self.redis.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(set.is_some())
    }
}
