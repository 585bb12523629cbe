//! Broker configuration
//!
//! This module provides the configuration envelope shared by producers and
//! workers: `ConnectionConfig` for the Redis connection, `WorkerConfig` for
//! the dispatch/reclaim loops, and `BroadcastConfig` for the fan-out
//! listener.

use crate::error::BackstageError;
use crate::keys::DEFAULT_PREFIX;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Default consumer group shared by all workers of a deployment.
pub const DEFAULT_CONSUMER_GROUP: &str = "backstage-workers";

/// Redis connection settings plus the key prefix.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Key prefix for all broker state (default: "backstage").
    pub prefix: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Build a `redis://` connection URL from the settings.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Open a managed connection (auto-reconnecting, cloneable handle).
    pub async fn connect(&self) -> Result<ConnectionManager, BackstageError> {
        let client = redis::Client::open(self.url())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(manager)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// A named custom queue.
///
/// Custom queues get their own stream under the shared consumer group and are
/// dispatched after the built-in tiers, ordered by `priority` ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub priority: i32,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Configuration for the worker's dispatch and maintenance loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer group shared by all workers of the deployment.
    pub consumer_group: String,
    /// This worker's consumer name within the group.
    pub worker_id: String,
    /// Max time a group read blocks waiting for messages.
    pub block_timeout: Duration,
    /// Cadence of the pending-entry reclaimer.
    pub reclaimer_interval: Duration,
    /// Pending idle age after which a message becomes claimable.
    pub idle_timeout: Duration,
    /// Delivery count bound; exceeding it strictly dead-letters the task.
    pub max_deliveries: u64,
    /// How long shutdown waits for in-flight handlers.
    pub grace_period: Duration,
    /// Max messages fetched per group read.
    pub prefetch: usize,
    /// Max handler invocations in flight.
    pub concurrency: usize,
    /// Custom queues to consume in addition to the priority tiers.
    pub queues: Vec<QueueSpec>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            worker_id: default_worker_id(),
            block_timeout: Duration::from_secs(5),
            reclaimer_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_deliveries: 5,
            grace_period: Duration::from_secs(30),
            prefetch: 10,
            concurrency: 50,
            queues: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_reclaimer_interval(mut self, interval: Duration) -> Self {
        self.reclaimer_interval = interval;
        self
    }

    /// `idle_timeout` must exceed the longest expected handler duration plus
    /// a safety margin, or healthy in-progress tasks get stolen.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_deliveries(mut self, max: u64) -> Self {
        self.max_deliveries = max;
        self
    }

    pub fn with_grace_period(mut self, period: Duration) -> Self {
        self.grace_period = period;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Register a custom queue for this worker to consume.
    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }
}

/// Configuration for the broadcast listener.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Consumer idle age beyond which another worker's group counts as stale.
    pub consumer_idle_threshold: Duration,
    /// Max time a broadcast group read blocks.
    pub block_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            consumer_idle_threshold: Duration::from_secs(3600),
            block_timeout: Duration::from_secs(5),
        }
    }
}

impl BroadcastConfig {
    pub fn with_consumer_idle_threshold(mut self, threshold: Duration) -> Self {
        self.consumer_idle_threshold = threshold;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }
}

/// Default worker identity: `<hostname>-<pid>`.
///
/// Stable across the process lifetime, unique per process on a host, and
/// readable in XINFO output when debugging a deployment.
pub fn default_worker_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", hostname, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6379);
        assert_eq!(config.db, 0);
        assert_eq!(config.prefix, "backstage");
        assert_eq!(config.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_connection_url_with_password() {
        let config = ConnectionConfig::default()
            .with_host("redis.internal")
            .with_port(6380)
            .with_password("s3cret")
            .with_db(2);
        assert_eq!(config.url(), "redis://:s3cret@redis.internal:6380/2");
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.consumer_group, "backstage-workers");
        assert_eq!(config.block_timeout, Duration::from_secs(5));
        assert_eq!(config.reclaimer_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_deliveries, 5);
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.concurrency, 50);
        assert!(config.queues.is_empty());
    }

    #[test]
    fn test_worker_builder() {
        let config = WorkerConfig::default()
            .with_worker_id("worker-1")
            .with_concurrency(4)
            .with_prefetch(2)
            .with_queue(QueueSpec::new("reports", 10));
        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.prefetch, 2);
        assert_eq!(config.queues, vec![QueueSpec::new("reports", 10)]);
    }

    #[test]
    fn test_caps_never_zero() {
        let config = WorkerConfig::default().with_concurrency(0).with_prefetch(0);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.prefetch, 1);
    }

    #[test]
    fn test_broadcast_defaults() {
        let config = BroadcastConfig::default();
        assert_eq!(config.consumer_idle_threshold, Duration::from_secs(3600));
        assert_eq!(config.block_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_default_worker_id_includes_pid() {
        let id = default_worker_id();
        assert!(id.ends_with(&std::process::id().to_string()));
    }
}
