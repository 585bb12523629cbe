//! Backstage: a Redis-Streams background job broker.
//!
//! Producers append tasks to per-priority streams (or a delayed sorted set,
//! or a broadcast stream); workers consume them under a shared consumer
//! group with at-least-once delivery.
//!
//! ## Features
//!
//! - **Priority queues**: strict `urgent` → `default` → `low` dispatch, plus
//!   named custom queues
//! - **Delayed scheduling**: tasks parked in a sorted set and promoted
//!   atomically by a server-side script
//! - **Deduplication**: TTL-bound guard keys gate duplicate enqueues
//! - **Crash recovery**: a reclaimer re-owns idle pending messages and
//!   dead-letters repeat offenders
//! - **Broadcast fan-out**: one message delivered to every worker via
//!   per-worker consumer groups
//! - **Workflow chaining**: handlers return a continuation to enqueue next
//! - **Cron schedules**: recurring enqueues from 5-field expressions
//! - **Prometheus metrics** and K8s-ready health/admin endpoints
//!
//! ## Example
//!
//! ```ignore
//! use backstage::{ConnectionConfig, KeySpace, Worker, WorkerConfig};
//! use tokio::sync::watch;
//!
//! let connection = ConnectionConfig::default();
//! let mut worker = Worker::connect(connection, WorkerConfig::default()).await?;
//!
//! worker.on("email.send", |payload: EmailPayload| async move {
//!     send_email(payload).await?;
//!     Ok(None)
//! });
//!
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//! worker.run(shutdown_rx).await?;
//! ```

mod broadcast;
mod config;
mod consumer;
mod cron;
mod dlq;
mod error;
mod handler;
mod health;
mod inspect;
mod keys;
mod message;
pub mod metrics;
mod producer;
mod promoter;
mod reclaimer;
mod worker;

// Re-export main types
pub use broadcast::{BroadcastHandler, BroadcastListener, BroadcastMessage};
pub use config::{
    default_worker_id, BroadcastConfig, ConnectionConfig, QueueSpec, WorkerConfig,
    DEFAULT_CONSUMER_GROUP,
};
pub use consumer::{ClaimedEntry, Delivery, GroupConsumer, PendingEntry};
pub use cron::{CronSchedule, CronScheduler, CronTask};
pub use dlq::{DeadLetterEntry, DeadLetterQueue};
pub use error::BackstageError;
pub use handler::{HandlerOutcome, HandlerRegistry, TaskError, TaskHandler};
pub use health::{full_admin_router, health_router, HealthState};
pub use inspect::{BrokerSnapshot, Inspector, QueueStats};
pub use keys::{KeySpace, DEFAULT_PREFIX};
pub use message::{
    now_ms, BackoffKind, BackoffPolicy, Chain, Priority, ScheduledTask, TaskMessage,
};
pub use producer::{Dedupe, EnqueueOptions, EnqueueOutcome, Producer};
pub use promoter::ScheduledPromoter;
pub use worker::Worker;
