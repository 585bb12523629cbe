//! Deduplication window semantics.

mod helpers;

use backstage::{Dedupe, EnqueueOptions, KeySpace, Producer};
use std::time::Duration;
use test_utils::TestRedis;

#[tokio::test]
async fn second_enqueue_within_window_is_skipped() {
    let redis = TestRedis::new().await;
    let producer = Producer::new(redis.manager(), KeySpace::default());

    let opts = || {
        EnqueueOptions::new()
            .with_dedupe(Dedupe::new("order-7").with_ttl(Duration::from_secs(60)))
    };

    let first = producer
        .enqueue("order.create", &serde_json::json!({"id": "7"}), opts())
        .await
        .unwrap();
    assert!(first.id().is_some());
    assert!(!first.is_deduplicated());

    let second = producer
        .enqueue("order.create", &serde_json::json!({"id": "7"}), opts())
        .await
        .unwrap();
    assert!(second.is_deduplicated());
    assert_eq!(second.id(), None);

    // Exactly one stream message was produced.
    let mut conn = redis.manager();
    assert_eq!(helpers::xlen(&mut conn, "backstage:default").await, 1);
}

#[tokio::test]
async fn different_keys_do_not_collide() {
    let redis = TestRedis::new().await;
    let producer = Producer::new(redis.manager(), KeySpace::default());

    for key in ["order-1", "order-2"] {
        let outcome = producer
            .enqueue(
                "order.create",
                &serde_json::json!({"id": key}),
                EnqueueOptions::new().with_dedupe(Dedupe::new(key)),
            )
            .await
            .unwrap();
        assert!(!outcome.is_deduplicated());
    }

    let mut conn = redis.manager();
    assert_eq!(helpers::xlen(&mut conn, "backstage:default").await, 2);
}

#[tokio::test]
async fn window_expiry_allows_re_enqueue() {
    let redis = TestRedis::new().await;
    let producer = Producer::new(redis.manager(), KeySpace::default());

    let opts = || {
        EnqueueOptions::new()
            .with_dedupe(Dedupe::new("short").with_ttl(Duration::from_millis(300)))
    };

    let first = producer
        .enqueue("ping", &serde_json::Value::Null, opts())
        .await
        .unwrap();
    assert!(!first.is_deduplicated());

    tokio::time::sleep(Duration::from_millis(600)).await;

    let second = producer
        .enqueue("ping", &serde_json::Value::Null, opts())
        .await
        .unwrap();
    assert!(!second.is_deduplicated());
}

#[tokio::test]
async fn broadcast_is_never_deduplicated() {
    let redis = TestRedis::new().await;
    let producer = Producer::new(redis.manager(), KeySpace::default());

    let first = producer
        .broadcast("cache.invalidate", &serde_json::json!({"key": "users"}))
        .await
        .unwrap();
    let second = producer
        .broadcast("cache.invalidate", &serde_json::json!({"key": "users"}))
        .await
        .unwrap();
    assert_ne!(first, second);

    let mut conn = redis.manager();
    assert_eq!(helpers::xlen(&mut conn, "backstage:broadcast").await, 2);
}
