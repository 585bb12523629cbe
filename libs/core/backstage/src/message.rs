//! Wire-level task types.
//!
//! Stream messages carry their task as a flat field map. The first three
//! fields are always `taskName`, `payload`, `enqueuedAt`, in that order, so
//! that workers written against other client stacks can consume the same
//! streams. Optional execution metadata (`attempts`, `backoff`, `timeout`)
//! follows when present. All values are strings; an absent payload is the
//! literal string `null`.

use crate::error::BackstageError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumString};

/// Priority tiers for the built-in queues.
///
/// Dispatch order is strict: `urgent` drains before `default`, which drains
/// before `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    #[default]
    Default,
    Low,
}

impl Priority {
    /// All tiers in dispatch order.
    pub fn all() -> [Priority; 3] {
        [Priority::Urgent, Priority::Default, Priority::Low]
    }
}

/// Retry backoff strategy carried alongside a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry backoff policy. Serialized as `{"type","delay","maxDelay"}` on the
/// wire, delays in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay: i64,
    #[serde(rename = "maxDelay", default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<i64>,
}

/// Workflow continuation returned by a handler: enqueue `next` after the
/// current task acknowledges, optionally delayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub next: String,
    /// Delay before `next` becomes runnable, in milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Chain {
    pub fn new(next: impl Into<String>) -> Self {
        Self {
            next: next.into(),
            delay: 0,
            payload: None,
        }
    }

    pub fn with_delay_ms(mut self, delay: i64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A task as carried on a stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub task_name: String,
    /// Serialized payload; `"null"` when the producer supplied none.
    pub payload: String,
    /// Enqueue time, milliseconds since epoch.
    pub enqueued_at: i64,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    /// Handler execution budget in milliseconds.
    pub timeout: Option<i64>,
}

impl TaskMessage {
    pub fn new(task_name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            payload: payload.into(),
            enqueued_at: now_ms(),
            attempts: None,
            backoff: None,
            timeout: None,
        }
    }

    /// Field pairs in canonical wire order.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, BackstageError> {
        let mut fields = vec![
            ("taskName", self.task_name.clone()),
            ("payload", self.payload.clone()),
            ("enqueuedAt", self.enqueued_at.to_string()),
        ];
        if let Some(attempts) = self.attempts {
            fields.push(("attempts", attempts.to_string()));
        }
        if let Some(backoff) = &self.backoff {
            fields.push(("backoff", serde_json::to_string(backoff)?));
        }
        if let Some(timeout) = self.timeout {
            fields.push(("timeout", timeout.to_string()));
        }
        Ok(fields)
    }

    /// Parse a task from a stream entry's field map.
    pub fn from_map(map: &HashMap<String, redis::Value>) -> Result<Self, BackstageError> {
        let task_name = field_str(map, "taskName")
            .ok_or_else(|| BackstageError::MessageParsing("missing taskName field".to_string()))?;
        if task_name.is_empty() {
            return Err(BackstageError::MessageParsing(
                "empty taskName field".to_string(),
            ));
        }

        let payload = field_str(map, "payload").unwrap_or_else(|| "null".to_string());
        let enqueued_at = field_str(map, "enqueuedAt")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let attempts = field_str(map, "attempts").and_then(|s| s.parse::<u32>().ok());
        let backoff = field_str(map, "backoff").and_then(|s| serde_json::from_str(&s).ok());
        let timeout = field_str(map, "timeout").and_then(|s| s.parse::<i64>().ok());

        Ok(Self {
            task_name,
            payload,
            enqueued_at,
            attempts,
            backoff,
            timeout,
        })
    }
}

/// Member stored in the delayed sorted set. Carries everything needed to
/// rebuild a stream message when the entry comes due, including the resolved
/// target `streamKey` (`priority` is kept as a fallback hint for members
/// written by older producers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    #[serde(rename = "taskName")]
    pub task_name: String,
    pub payload: String,
    #[serde(rename = "enqueuedAt")]
    pub enqueued_at: i64,
    #[serde(rename = "streamKey", default, skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

/// Current time, milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Extract a string field from a stream entry value map.
pub(crate) fn field_str(map: &HashMap<String, redis::Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}
