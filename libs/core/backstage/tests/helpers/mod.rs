//! Shared helpers for broker integration tests.
#![allow(dead_code)]

use redis::aio::ConnectionManager;
use std::time::Duration;

pub async fn xlen(conn: &mut ConnectionManager, key: &str) -> i64 {
    redis::cmd("XLEN")
        .arg(key)
        .query_async(conn)
        .await
        .unwrap_or(0)
}

pub async fn zcard(conn: &mut ConnectionManager, key: &str) -> i64 {
    redis::cmd("ZCARD")
        .arg(key)
        .query_async(conn)
        .await
        .unwrap_or(0)
}

/// Pending-entry count for a consumer group (XPENDING summary form).
pub async fn pending_count(conn: &mut ConnectionManager, key: &str, group: &str) -> i64 {
    let reply: (i64, Option<String>, Option<String>, Option<Vec<(String, String)>>) =
        redis::cmd("XPENDING")
            .arg(key)
            .arg(group)
            .query_async(conn)
            .await
            .unwrap_or((0, None, None, None));
    reply.0
}

/// Names of all consumer groups on a stream.
pub async fn group_names(conn: &mut ConnectionManager, key: &str) -> Vec<String> {
    let reply: redis::streams::StreamInfoGroupsReply = match redis::cmd("XINFO")
        .arg("GROUPS")
        .arg(key)
        .query_async(conn)
        .await
    {
        Ok(reply) => reply,
        Err(_) => return vec![],
    };
    reply.groups.into_iter().map(|g| g.name).collect()
}

/// Last-delivered id of a consumer group ("0-0" until the first read).
pub async fn last_delivered_id(conn: &mut ConnectionManager, key: &str, group: &str) -> String {
    let reply: redis::streams::StreamInfoGroupsReply = match redis::cmd("XINFO")
        .arg("GROUPS")
        .arg(key)
        .query_async(conn)
        .await
    {
        Ok(reply) => reply,
        Err(_) => return "0-0".to_string(),
    };
    reply
        .groups
        .into_iter()
        .find(|g| g.name == group)
        .map(|g| g.last_delivered_id)
        .unwrap_or_else(|| "0-0".to_string())
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
