//! Redis key schema.
//!
//! All broker state lives under a single configurable prefix so that several
//! deployments can share one Redis instance:
//!
//! | Purpose         | Key                              |
//! |-----------------|----------------------------------|
//! | Priority stream | `<prefix>:urgent` / `:default` / `:low` / `:<queue>` |
//! | Delayed set     | `<prefix>:scheduled`             |
//! | Dead-letter     | `<prefix>:<priority>:dead-letter` |
//! | Broadcast       | `<prefix>:broadcast`             |
//! | Dedup guard     | `<prefix>:dedupe:<key>`          |

use crate::message::Priority;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "backstage";

/// Resolves Redis keys for a given prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.is_empty() {
            DEFAULT_PREFIX.to_string()
        } else {
            prefix
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Stream key for a priority tier.
    pub fn priority_stream(&self, priority: Priority) -> String {
        format!("{}:{}", self.prefix, priority)
    }

    /// Stream key for a named custom queue.
    pub fn queue_stream(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    /// Sorted set holding delayed tasks, scored by execute-at millis.
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    /// Dead-letter stream for a priority tier.
    pub fn dead_letter(&self, priority: Priority) -> String {
        format!("{}:{}:dead-letter", self.prefix, priority)
    }

    /// The single broadcast stream shared by all workers.
    pub fn broadcast(&self) -> String {
        format!("{}:broadcast", self.prefix)
    }

    /// TTL-bound guard key for a user-supplied dedup key.
    pub fn dedupe(&self, key: &str) -> String {
        format!("{}:dedupe:{}", self.prefix, key)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
