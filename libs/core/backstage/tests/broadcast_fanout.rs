//! Broadcast fan-out: one message per worker, and stale-group reaping.

mod helpers;

use backstage::{BroadcastConfig, BroadcastListener, KeySpace, Producer};
use std::time::Duration;
use test_utils::TestRedis;

fn listener(redis: &TestRedis, worker_id: &str) -> BroadcastListener {
    BroadcastListener::new(
        redis.manager(),
        KeySpace::default(),
        worker_id,
        BroadcastConfig::default(),
    )
}

#[tokio::test]
async fn every_worker_receives_every_message() {
    let redis = TestRedis::new().await;
    let producer = Producer::new(redis.manager(), KeySpace::default());

    let worker_one = listener(&redis, "w1");
    worker_one.initialize().await.unwrap();

    let id = producer
        .broadcast("cache.invalidate", &serde_json::json!({"key": "users"}))
        .await
        .unwrap();

    // A worker started after the send still sees the message: its group is
    // created at offset 0.
    let worker_two = listener(&redis, "w2");
    worker_two.initialize().await.unwrap();

    for listener in [&worker_one, &worker_two] {
        let batch = listener.read(Duration::from_millis(500)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].task_name, "cache.invalidate");
        assert_eq!(batch[0].payload, r#"{"key":"users"}"#);
        listener.ack(&batch[0].id).await.unwrap();
    }

    // Per-group PELs drain independently.
    let mut conn = redis.manager();
    for group in ["broadcast-w1", "broadcast-w2"] {
        assert_eq!(
            helpers::pending_count(&mut conn, "backstage:broadcast", group).await,
            0
        );
    }
}

#[tokio::test]
async fn each_group_delivers_at_most_once() {
    let redis = TestRedis::new().await;
    let producer = Producer::new(redis.manager(), KeySpace::default());

    let worker = listener(&redis, "w1");
    worker.initialize().await.unwrap();

    producer
        .broadcast("config.reload", &serde_json::Value::Null)
        .await
        .unwrap();

    let batch = worker.read(Duration::from_millis(500)).await.unwrap();
    assert_eq!(batch.len(), 1);
    worker.ack(&batch[0].id).await.unwrap();

    // Nothing new for this group.
    let again = worker.read(Duration::from_millis(300)).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn reaper_destroys_stale_groups_but_never_its_own() {
    let redis = TestRedis::new().await;
    let producer = Producer::new(redis.manager(), KeySpace::default());

    let worker = listener(&redis, "w1");
    worker.initialize().await.unwrap();

    producer
        .broadcast("noop", &serde_json::Value::Null)
        .await
        .unwrap();

    // Attach a consumer to our own group so it would look idle-but-present
    // to a naive reaper.
    let _ = worker.read(Duration::from_millis(300)).await.unwrap();

    // A group left behind by a dead worker: no consumers ever attached.
    let mut conn = redis.manager();
    let _: () = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg("backstage:broadcast")
        .arg("broadcast-ghost")
        .arg("0")
        .query_async(&mut conn)
        .await
        .unwrap();

    let deleted = worker.cleanup().await.unwrap();
    assert_eq!(deleted, 1);

    let groups = helpers::group_names(&mut conn, "backstage:broadcast").await;
    assert!(groups.contains(&"broadcast-w1".to_string()));
    assert!(!groups.contains(&"broadcast-ghost".to_string()));
}
