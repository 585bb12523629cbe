//! Delayed-task scheduling and atomic promotion.

mod helpers;

use backstage::{
    now_ms, BackoffKind, BackoffPolicy, EnqueueOptions, KeySpace, Producer, ScheduledPromoter,
};
use std::time::Duration;
use test_utils::TestRedis;

#[tokio::test]
async fn past_due_task_promotes_on_next_tick() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    let outcome = producer
        .enqueue(
            "reminder",
            &serde_json::Value::Null,
            EnqueueOptions::new().with_delay_ms(-1000),
        )
        .await
        .unwrap();
    assert!(outcome.id().unwrap().starts_with("scheduled:"));

    let mut conn = redis.manager();
    assert_eq!(helpers::zcard(&mut conn, "backstage:scheduled").await, 1);
    assert_eq!(helpers::xlen(&mut conn, "backstage:default").await, 0);

    let promoter = ScheduledPromoter::new(redis.manager(), keys.clone());
    let promoted = promoter.promote_due(now_ms()).await.unwrap();
    assert_eq!(promoted, 1);

    // The entry moved set -> stream; it exists in exactly one place.
    assert_eq!(helpers::zcard(&mut conn, "backstage:scheduled").await, 0);
    assert_eq!(helpers::xlen(&mut conn, "backstage:default").await, 1);
}

#[tokio::test]
async fn future_task_stays_in_set() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    producer
        .schedule(
            "reminder",
            &serde_json::Value::Null,
            Duration::from_secs(3600),
            EnqueueOptions::new(),
        )
        .await
        .unwrap();

    let promoter = ScheduledPromoter::new(redis.manager(), keys);
    assert_eq!(promoter.promote_due(now_ms()).await.unwrap(), 0);

    let mut conn = redis.manager();
    assert_eq!(helpers::zcard(&mut conn, "backstage:scheduled").await, 1);
    assert_eq!(helpers::xlen(&mut conn, "backstage:default").await, 0);
}

#[tokio::test]
async fn promotion_targets_the_custom_queue() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    producer
        .enqueue(
            "report.generate",
            &serde_json::json!({"month": "07"}),
            EnqueueOptions::new()
                .with_queue("reports")
                .with_delay_ms(-1),
        )
        .await
        .unwrap();

    let promoter = ScheduledPromoter::new(redis.manager(), keys);
    assert_eq!(promoter.promote_due(now_ms()).await.unwrap(), 1);

    let mut conn = redis.manager();
    assert_eq!(helpers::xlen(&mut conn, "backstage:reports").await, 1);
    assert_eq!(helpers::xlen(&mut conn, "backstage:default").await, 0);
}

#[tokio::test]
async fn promotion_carries_execution_metadata() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    producer
        .enqueue(
            "email.send",
            &serde_json::json!({"to": "a@b"}),
            EnqueueOptions::new()
                .with_delay_ms(-1)
                .with_attempts(3)
                .with_backoff(BackoffPolicy {
                    kind: BackoffKind::Exponential,
                    delay: 1000,
                    max_delay: Some(60_000),
                })
                .with_timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    let promoter = ScheduledPromoter::new(redis.manager(), keys);
    assert_eq!(promoter.promote_due(now_ms()).await.unwrap(), 1);

    let mut conn = redis.manager();
    let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
        .arg("backstage:default")
        .arg("-")
        .arg("+")
        .query_async(&mut conn)
        .await
        .unwrap();

    let entry = &reply.ids[0];
    for field in ["taskName", "payload", "enqueuedAt", "attempts", "backoff", "timeout"] {
        assert!(entry.map.contains_key(field), "missing field {}", field);
    }
}

#[tokio::test]
async fn concurrent_promoters_never_double_promote() {
    let redis = TestRedis::new().await;
    let keys = KeySpace::default();
    let producer = Producer::new(redis.manager(), keys.clone());

    for i in 0..10 {
        producer
            .enqueue(
                "tick",
                &serde_json::json!({"i": i}),
                EnqueueOptions::new().with_delay_ms(-1),
            )
            .await
            .unwrap();
    }

    let promoter_a = ScheduledPromoter::new(redis.manager(), keys.clone());
    let promoter_b = ScheduledPromoter::new(redis.manager(), keys);
    let cutoff = now_ms();

    let (a, b) = tokio::join!(promoter_a.promote_due(cutoff), promoter_b.promote_due(cutoff));
    assert_eq!(a.unwrap() + b.unwrap(), 10);

    let mut conn = redis.manager();
    assert_eq!(helpers::xlen(&mut conn, "backstage:default").await, 10);
    assert_eq!(helpers::zcard(&mut conn, "backstage:scheduled").await, 0);
}
