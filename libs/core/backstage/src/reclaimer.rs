//! Pending-entry reclaimer.
//!
//! Messages delivered to a worker that died (or stalled past the idle
//! timeout) stay in the pending entry list. The reclaimer periodically
//! claims such entries into the current worker and either re-executes them
//! or, once the delivery count exceeds the configured bound, moves them to
//! the dead-letter stream. It never deletes stream entries; it only
//! acknowledges and re-adds.

use crate::config::WorkerConfig;
use crate::consumer::GroupConsumer;
use crate::dlq::DeadLetterQueue;
use crate::error::BackstageError;
use crate::keys::KeySpace;
use crate::message::Priority;
use crate::metrics;
use crate::worker::Executor;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Pending entries examined per stream per pass.
const RECLAIM_BATCH: usize = 10;

pub(crate) struct Reclaimer {
    consumer: GroupConsumer,
    executor: Executor,
    dlq: DeadLetterQueue,
    keys: KeySpace,
    config: WorkerConfig,
}

impl Reclaimer {
    pub(crate) fn new(
        consumer: GroupConsumer,
        executor: Executor,
        keys: KeySpace,
        config: WorkerConfig,
    ) -> Self {
        let dlq = DeadLetterQueue::new(consumer.redis(), keys.clone());
        Self {
            consumer,
            executor,
            dlq,
            keys,
            config,
        }
    }

    /// Run reclaim passes on the configured interval until shutdown.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.config.reclaimer_interval;
        let mut ticker = tokio::time::interval_at(start, self.config.reclaimer_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Reclaim pass failed");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One reclaim pass over all priority streams. Returns how many entries
    /// were re-owned (re-executed or dead-lettered).
    pub(crate) async fn run_once(&self) -> Result<usize, BackstageError> {
        let mut reclaimed = 0;

        for priority in Priority::all() {
            let stream_key = self.keys.priority_stream(priority);

            let pending = match self
                .consumer
                .pending(&stream_key, self.config.idle_timeout, RECLAIM_BATCH)
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(stream = %stream_key, error = %e, "Pending scan failed");
                    continue;
                }
            };

            for entry in pending {
                // The min-idle guard makes this race-safe: whichever
                // reclaimer wins resets the idle clock, so the loser's claim
                // returns empty.
                let claimed = match self
                    .consumer
                    .claim(&stream_key, &entry.id, self.config.idle_timeout)
                    .await
                {
                    Ok(Some(claimed)) => claimed,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(stream = %stream_key, message_id = %entry.id, error = %e, "Claim failed");
                        continue;
                    }
                };

                // The claim itself is a delivery, on top of those the PEL
                // already recorded.
                let delivery_count = entry.delivery_count + 1;

                if delivery_count > self.config.max_deliveries {
                    if let Err(e) = self.dlq.push(priority, &claimed, delivery_count).await {
                        warn!(message_id = %claimed.id, error = %e, "Dead-letter push failed");
                        continue;
                    }
                    if let Err(e) = self.consumer.ack(&stream_key, &claimed.id).await {
                        warn!(message_id = %claimed.id, error = %e, "Dead-letter ACK failed");
                    }
                    reclaimed += 1;
                    continue;
                }

                match claimed.task() {
                    Ok(task) => {
                        debug!(
                            stream = %stream_key,
                            message_id = %claimed.id,
                            delivery_count,
                            previous_consumer = %entry.consumer,
                            "Reclaimed message"
                        );
                        metrics::record_reclaimed(&stream_key);
                        self.executor.execute(&stream_key, &claimed.id, task).await;
                        reclaimed += 1;
                    }
                    Err(e) => {
                        // Leave it pending; the delivery counter keeps
                        // growing and the entry dead-letters on a later pass.
                        warn!(message_id = %claimed.id, error = %e, "Claimed message unparseable");
                    }
                }
            }
        }

        Ok(reclaimed)
    }
}
