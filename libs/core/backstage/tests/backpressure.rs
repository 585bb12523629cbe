//! Concurrency cap enforcement: in-flight handlers never exceed the budget.

mod helpers;

use backstage::{Chain, EnqueueOptions, KeySpace, Producer, TaskError, Worker, WorkerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_utils::TestRedis;
use tokio::sync::{mpsc, watch};

#[tokio::test]
async fn in_flight_never_exceeds_concurrency_cap() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    const CAP: usize = 2;
    const TASKS: usize = 6;

    let config = WorkerConfig::default()
        .with_worker_id("backpressure-worker")
        .with_block_timeout(Duration::from_millis(500))
        .with_concurrency(CAP)
        .with_prefetch(10);

    let mut worker = Worker::new(redis.manager(), keys, config);

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    {
        let in_flight = in_flight.clone();
        let max_observed = max_observed.clone();
        worker.on("slow.task", move |_: serde_json::Value| {
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            let tx = tx.clone();
            async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(current, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(300)).await;

                in_flight.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).ok();
                Ok::<Option<Chain>, TaskError>(None)
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    for i in 0..TASKS {
        producer
            .enqueue("slow.task", &serde_json::json!({"i": i}), EnqueueOptions::new())
            .await
            .unwrap();
    }

    for _ in 0..TASKS {
        tokio::time::timeout(Duration::from_secs(20), rx.recv())
            .await
            .expect("task did not complete")
            .unwrap();
    }

    assert!(
        max_observed.load(Ordering::SeqCst) <= CAP,
        "observed {} concurrent handlers with cap {}",
        max_observed.load(Ordering::SeqCst),
        CAP
    );

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
}
