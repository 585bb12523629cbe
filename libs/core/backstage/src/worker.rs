//! The worker: dispatch loop, handler execution, and subsystem composition.
//!
//! A `Worker` owns a handler registry and composes the dispatch loop with
//! the pending-entry reclaimer, the delayed-task promoter, and (when a
//! broadcast handler is registered) the broadcast listener. All subsystems
//! share the managed Redis connection and a `watch` shutdown channel; inside
//! the worker the dispatch loop is serial while handler invocations run in
//! parallel up to the concurrency cap.

use crate::broadcast::{BroadcastHandler, BroadcastListener, BroadcastMessage, FnBroadcastHandler};
use crate::config::{BroadcastConfig, ConnectionConfig, WorkerConfig};
use crate::consumer::GroupConsumer;
use crate::error::BackstageError;
use crate::handler::{HandlerOutcome, HandlerRegistry, TaskHandler};
use crate::keys::KeySpace;
use crate::message::{Priority, TaskMessage};
use crate::metrics;
use crate::producer::{EnqueueOptions, Producer};
use crate::promoter::ScheduledPromoter;
use crate::reclaimer::Reclaimer;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_READ_BACKOFF_SECS: u64 = 30;

/// Invokes handlers for delivered messages and settles the outcome:
/// acknowledge on success, enqueue-then-acknowledge on continuation, leave
/// pending on failure.
#[derive(Clone)]
pub(crate) struct Executor {
    registry: Arc<HandlerRegistry>,
    consumer: GroupConsumer,
    producer: Producer,
}

impl Executor {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        consumer: GroupConsumer,
        producer: Producer,
    ) -> Self {
        Self {
            registry,
            consumer,
            producer,
        }
    }

    /// Process one delivered message to completion.
    pub(crate) async fn execute(&self, stream_key: &str, message_id: &str, message: TaskMessage) {
        let Some(handler) = self.registry.get(&message.task_name) else {
            // No handler registered: discard instead of letting the message
            // cycle through the reclaimer forever.
            warn!(task = %message.task_name, message_id = %message_id, "Unknown task, discarding");
            metrics::record_processed(stream_key, "discarded");
            self.ack_or_log(stream_key, message_id).await;
            return;
        };

        let start = Instant::now();
        let outcome = handler.handle(&message.payload).await;

        match outcome {
            Ok(continuation) => {
                metrics::record_processed(stream_key, "success");
                metrics::record_duration(stream_key, start.elapsed());

                if let Some(chain) = continuation {
                    let payload = chain.payload.unwrap_or(serde_json::Value::Null);
                    let mut opts = EnqueueOptions::new();
                    if chain.delay > 0 {
                        opts = opts.with_delay_ms(chain.delay);
                    }
                    if let Err(e) = self.producer.enqueue(&chain.next, &payload, opts).await {
                        // Leave the current message pending; redelivery
                        // re-runs the handler and retries the chain.
                        warn!(
                            task = %message.task_name,
                            next = %chain.next,
                            error = %e,
                            "Failed to enqueue continuation, leaving message pending"
                        );
                        return;
                    }
                    debug!(task = %message.task_name, next = %chain.next, "Enqueued continuation");
                }

                self.ack_or_log(stream_key, message_id).await;
            }
            Err(e) => {
                // No ack: the reclaimer retries or dead-letters it.
                warn!(
                    task = %message.task_name,
                    message_id = %message_id,
                    error = %e,
                    "Task failed"
                );
                metrics::record_processed(stream_key, "failed");
            }
        }
    }

    async fn ack_or_log(&self, stream_key: &str, message_id: &str) {
        if let Err(e) = self.consumer.ack(stream_key, message_id).await {
            error!(stream = %stream_key, message_id = %message_id, error = %e, "Failed to ACK message");
        }
    }
}

/// A background-job worker.
///
/// # Example
///
/// ```rust,ignore
/// use backstage::{ConnectionConfig, Worker, WorkerConfig};
///
/// let redis = ConnectionConfig::default().connect().await?;
/// let mut worker = Worker::new(redis, KeySpace::default(), WorkerConfig::default());
/// worker.on("email.send", |payload: EmailPayload| async move {
///     send_email(payload).await?;
///     Ok(None)
/// });
/// worker.run(shutdown_rx).await?;
/// ```
pub struct Worker {
    redis: ConnectionManager,
    keys: KeySpace,
    config: WorkerConfig,
    broadcast_config: BroadcastConfig,
    registry: HandlerRegistry,
    broadcast_handler: Option<Arc<dyn BroadcastHandler>>,
}

impl Worker {
    pub fn new(redis: ConnectionManager, keys: KeySpace, config: WorkerConfig) -> Self {
        Self {
            redis,
            keys,
            config,
            broadcast_config: BroadcastConfig::default(),
            registry: HandlerRegistry::new(),
            broadcast_handler: None,
        }
    }

    /// Connect and build a worker in one step.
    pub async fn connect(
        connection: ConnectionConfig,
        config: WorkerConfig,
    ) -> Result<Self, BackstageError> {
        let keys = KeySpace::new(connection.prefix.clone());
        let redis = connection.connect().await?;
        Ok(Self::new(redis, keys, config))
    }

    pub fn with_broadcast_config(mut self, config: BroadcastConfig) -> Self {
        self.broadcast_config = config;
        self
    }

    /// Register an async closure for a task name, with typed payload
    /// decoding. A payload that fails to decode counts as a handler failure.
    pub fn on<T, F, Fut>(&mut self, task_name: impl Into<String>, f: F)
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.registry.on(task_name, f);
    }

    /// Register a handler object for a task name.
    pub fn register(&mut self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.registry.register(task_name, handler);
    }

    /// Register a handler for broadcast messages. Enables the broadcast
    /// listener when the worker runs.
    pub fn on_broadcast<F, Fut>(&mut self, f: F)
    where
        F: Fn(BroadcastMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), crate::handler::TaskError>> + Send + 'static,
    {
        self.broadcast_handler = Some(Arc::new(FnBroadcastHandler::new(f)));
    }

    /// A producer sharing this worker's connection and keyspace.
    pub fn producer(&self) -> Producer {
        Producer::new(self.redis.clone(), self.keys.clone())
    }

    /// The ordered list of streams this worker consumes: priority tiers
    /// first, then custom queues by ascending numeric priority.
    fn stream_keys(&self) -> Vec<String> {
        ordered_streams(&self.keys, &self.config.queues)
    }

    /// Run the worker until the shutdown channel flips.
    ///
    /// Creates the consumer groups, starts the reclaimer, the promoter, and
    /// (if registered) the broadcast listener, then drives the dispatch
    /// loop. On shutdown the loop stops reading after the current blocking
    /// read returns and waits up to the grace period for in-flight handlers;
    /// anything still running is left pending for other workers to reclaim.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), BackstageError> {
        let streams = self.stream_keys();
        let consumer = GroupConsumer::new(
            self.redis.clone(),
            self.config.consumer_group.clone(),
            self.config.worker_id.clone(),
        );

        info!(
            worker_id = %self.config.worker_id,
            group = %self.config.consumer_group,
            streams = ?streams,
            concurrency = %self.config.concurrency,
            prefetch = %self.config.prefetch,
            "Starting worker"
        );

        for stream_key in &streams {
            consumer.ensure_group(stream_key).await?;
        }

        let executor = Executor::new(
            Arc::new(self.registry.clone()),
            consumer.clone(),
            self.producer(),
        );

        let mut background = JoinSet::new();

        let reclaimer = Reclaimer::new(
            consumer.clone(),
            executor.clone(),
            self.keys.clone(),
            self.config.clone(),
        );
        background.spawn(reclaimer.run(shutdown.clone()));

        let promoter = ScheduledPromoter::new(self.redis.clone(), self.keys.clone());
        background.spawn(promoter.run(shutdown.clone()));

        if let Some(handler) = &self.broadcast_handler {
            let listener = BroadcastListener::new(
                self.redis.clone(),
                self.keys.clone(),
                self.config.worker_id.clone(),
                self.broadcast_config.clone(),
            )
            .with_handler(handler.clone());
            let listener_shutdown = shutdown.clone();
            background.spawn(async move {
                if let Err(e) = listener.run(listener_shutdown).await {
                    error!(error = %e, "Broadcast listener failed");
                }
            });
        }

        self.dispatch_loop(&streams, &consumer, &executor, shutdown.clone())
            .await;

        // Background loops watch the same channel; give them a moment to
        // unwind, then drop them with the JoinSet.
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while background.join_next().await.is_some() {}
        })
        .await;
        background.abort_all();

        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    async fn dispatch_loop(
        &self,
        streams: &[String],
        consumer: &GroupConsumer,
        executor: &Executor,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        while !*shutdown.borrow() {
            // Reap finished handlers so the set stays bounded.
            while in_flight.try_join_next().is_some() {}
            metrics::set_in_flight(
                self.config.concurrency - semaphore.available_permits(),
            );

            let available = semaphore.available_permits();
            if available == 0 {
                // At capacity: wait for one in-flight handler to finish.
                tokio::select! {
                    _ = in_flight.join_next() => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let count = available.min(self.config.prefetch);
            match consumer.read(streams, count, self.config.block_timeout).await {
                Ok(deliveries) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Read recovered");
                        consecutive_errors = 0;
                    }

                    for delivery in deliveries {
                        let permit = semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("Semaphore closed");
                        let executor = executor.clone();
                        in_flight.spawn(async move {
                            let crate::consumer::Delivery {
                                stream_key,
                                id,
                                message,
                            } = delivery;
                            executor.execute(&stream_key, &id, message).await;
                            drop(permit);
                        });
                    }
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    consecutive_errors += 1;

                    if e.is_nogroup_error() {
                        // The group was destroyed out-of-band (operator
                        // action, store restart): recreate and carry on.
                        warn!(error = %e, "Consumer group missing, recreating");
                        for stream_key in streams {
                            if let Err(create_err) = consumer.ensure_group(stream_key).await {
                                error!(
                                    stream = %stream_key,
                                    error = %create_err,
                                    "Failed to recreate consumer group"
                                );
                            }
                        }
                    }

                    let backoff_secs = if e.is_connection_error() {
                        2u64.pow(consecutive_errors.min(5)).min(MAX_READ_BACKOFF_SECS)
                    } else {
                        1
                    };
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Read error, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                }
            }
        }

        info!(
            in_flight = in_flight.len(),
            grace_secs = self.config.grace_period.as_secs(),
            "Shutting down, waiting for in-flight tasks"
        );

        let drained = tokio::time::timeout(self.config.grace_period, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                "Grace period expired, leaving tasks pending for reclaim"
            );
        }
        metrics::set_in_flight(0);
    }
}

/// Priority tiers first (urgent, default, low), then custom queues sorted by
/// ascending numeric priority. The group read returns messages from the
/// first stream that has any, so this order is the dispatch order.
fn ordered_streams(keys: &KeySpace, queues: &[crate::config::QueueSpec]) -> Vec<String> {
    let mut streams: Vec<String> = Priority::all()
        .iter()
        .map(|p| keys.priority_stream(*p))
        .collect();

    let mut queues = queues.to_vec();
    queues.sort_by_key(|q| q.priority);
    streams.extend(queues.iter().map(|q| keys.queue_stream(&q.name)));

    streams
}
