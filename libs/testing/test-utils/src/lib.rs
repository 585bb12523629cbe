//! Shared test utilities for broker integration tests
//!
//! This crate provides reusable test infrastructure:
//! - `TestRedis`: Redis container with automatic cleanup
//! - `unique_prefix`: deterministic per-test key prefixes
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::TestRedis;
//!
//! #[tokio::test]
//! async fn my_stream_test() {
//!     let redis = TestRedis::new().await;
//!     let conn = redis.manager();
//!     // Pass conn to the component under test
//! }
//! ```

mod redis;

pub use redis::TestRedis;

/// Derive a deterministic, test-scoped key prefix from the test name.
///
/// Keeps tests that share a container (or a developer's local Redis) from
/// stepping on each other's keys.
pub fn unique_prefix(test_name: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    format!("test-{:x}", hasher.finish())
}
