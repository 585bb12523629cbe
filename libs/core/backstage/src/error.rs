//! Error types for broker operations.
//!
//! This module provides `BackstageError`, the main error type for producer,
//! worker, and maintenance operations, along with predicate helpers for the
//! Redis error strings the worker loops need to distinguish.

use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug)]
pub enum BackstageError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Consumer group error.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Malformed stream message (missing or unreadable fields).
    #[error("Message parsing error: {0}")]
    MessageParsing(String),

    /// Invalid cron expression.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackstageError {
    /// Check if this is a BLOCK timeout (normal behavior, not an error).
    ///
    /// When using XREADGROUP with BLOCK, a timeout means no messages arrived
    /// within the block period. This is expected behavior, not an error.
    pub fn is_block_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timed out") && !err_str.contains("connection")
            }
            _ => false,
        }
    }

    /// Check if this is a connection-related error that might be recoverable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                if self.is_block_timeout() {
                    return false;
                }
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            _ => false,
        }
    }

    /// Check if this is a consumer group missing error (NOGROUP).
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::ConsumerGroup(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }

    /// Check if the server reported a script as not cached (NOSCRIPT).
    ///
    /// The promotion path goes through `redis::Script`, which reloads and
    /// retries on this transparently; callers issuing EVALSHA by hand use
    /// this to decide on a reload.
    pub fn is_noscript(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOSCRIPT"),
            _ => false,
        }
    }
}

/// Check a raw Redis error for the BUSYGROUP reply sent when a consumer
/// group already exists. Group creation treats it as success.
pub(crate) fn is_busygroup(e: &redis::RedisError) -> bool {
    e.to_string().contains("BUSYGROUP")
}
