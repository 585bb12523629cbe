//! Recovery of messages abandoned by a dead worker: reclaim and dead-letter.

mod helpers;

use backstage::{
    Chain, EnqueueOptions, GroupConsumer, KeySpace, Producer, TaskError, Worker, WorkerConfig,
};
use std::time::Duration;
use test_utils::TestRedis;
use tokio::sync::{mpsc, watch};

/// Read one message as a consumer that then "dies" without acknowledging.
async fn deliver_and_abandon(redis: &TestRedis, group: &str, consumer: &str) {
    let dead = GroupConsumer::new(redis.manager(), group, consumer);
    dead.ensure_group("backstage:default").await.unwrap();

    let streams = ["backstage:default".to_string()];
    let deliveries = dead
        .read(&streams, 1, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1, "abandoned read must deliver");
}

#[tokio::test]
async fn reclaimed_message_is_re_executed() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    let config = WorkerConfig::default()
        .with_worker_id("survivor")
        .with_block_timeout(Duration::from_millis(500))
        .with_idle_timeout(Duration::from_millis(200))
        .with_reclaimer_interval(Duration::from_millis(300));
    let group = config.consumer_group.clone();

    producer
        .enqueue(
            "email.send",
            &serde_json::json!({"to": "a@b"}),
            EnqueueOptions::new(),
        )
        .await
        .unwrap();

    // Worker A delivers the message and dies before acknowledging.
    deliver_and_abandon(&redis, &group, "crashed-worker").await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Worker B's reclaimer claims and re-executes it.
    let mut worker = Worker::new(redis.manager(), keys, config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    worker.on("email.send", move |payload: serde_json::Value| {
        let tx = tx.clone();
        async move {
            tx.send(payload).ok();
            Ok::<Option<Chain>, TaskError>(None)
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let payload = tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("reclaimed message was not re-executed")
        .unwrap();
    assert_eq!(payload, serde_json::json!({"to": "a@b"}));

    let mut conn = redis.manager();
    let drained = helpers::wait_until(Duration::from_secs(5), || {
        let mut conn = conn.clone();
        let group = group.clone();
        async move { helpers::pending_count(&mut conn, "backstage:default", &group).await == 0 }
    })
    .await;
    assert!(drained);

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
}

#[tokio::test]
async fn repeat_offender_is_dead_lettered() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    // max_deliveries 1: the abandoned delivery plus the claim exceeds it.
    let config = WorkerConfig::default()
        .with_worker_id("survivor")
        .with_block_timeout(Duration::from_millis(500))
        .with_idle_timeout(Duration::from_millis(200))
        .with_reclaimer_interval(Duration::from_millis(300))
        .with_max_deliveries(1);
    let group = config.consumer_group.clone();

    producer
        .enqueue("poison", &serde_json::json!({"bad": true}), EnqueueOptions::new())
        .await
        .unwrap();

    deliver_and_abandon(&redis, &group, "crashed-worker").await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut worker = Worker::new(redis.manager(), keys, config);
    worker.on("poison", |_: serde_json::Value| async move {
        // A dead-lettered task must never reach its handler again.
        if true {
            panic!("dead-lettered task was executed");
        }
        Ok::<Option<Chain>, TaskError>(None)
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let mut conn = redis.manager();
    let dead_lettered = helpers::wait_until(Duration::from_secs(15), || {
        let mut conn = conn.clone();
        async move { helpers::xlen(&mut conn, "backstage:default:dead-letter").await == 1 }
    })
    .await;
    assert!(dead_lettered, "message was not dead-lettered");

    // The dead-letter record carries the original task plus its audit trail.
    let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
        .arg("backstage:default:dead-letter")
        .arg("-")
        .arg("+")
        .query_async(&mut conn)
        .await
        .unwrap();
    let entry = &reply.ids[0];
    for field in ["taskName", "payload", "enqueuedAt", "originalId", "deliveryCount", "deadLetteredAt"] {
        assert!(entry.map.contains_key(field), "missing field {}", field);
    }

    // The original is acknowledged: dead-lettering is terminal.
    let drained = helpers::wait_until(Duration::from_secs(5), || {
        let mut conn = conn.clone();
        let group = group.clone();
        async move { helpers::pending_count(&mut conn, "backstage:default", &group).await == 0 }
    })
    .await;
    assert!(drained);
    assert_eq!(helpers::xlen(&mut conn, "backstage:default:dead-letter").await, 1);

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
}
