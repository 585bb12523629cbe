//! Task handlers and the per-worker handler registry.
//!
//! Handlers are registered under a task name and invoked with the raw
//! payload string. The typed registration path decodes the payload into the
//! handler's expected type first; a decode failure counts as a handler
//! failure so the message stays pending and is eventually retried or
//! dead-lettered.

use crate::message::Chain;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Error type handlers may fail with. The broker only consumes the success
/// signal; error contents are logged, never inspected.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a successful handler invocation: terminal, or a workflow
/// continuation to enqueue before acknowledging.
pub type HandlerOutcome = Result<Option<Chain>, TaskError>;

/// A task handler.
///
/// Implement this directly for handlers that manage their own payload
/// decoding, or use the typed registration on the worker, which wraps a
/// closure in a decoding adapter.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one task. `payload` is the raw serialized payload string
    /// (`"null"` when the producer supplied none).
    async fn handle(&self, payload: &str) -> HandlerOutcome;
}

/// Adapter wrapping an async closure with JSON payload decoding.
pub(crate) struct JsonHandler<T, F> {
    f: F,
    _payload: PhantomData<fn(T)>,
}

impl<T, F> JsonHandler<T, F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> TaskHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + Sync,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, payload: &str) -> HandlerOutcome {
        let value: T = serde_json::from_str(payload)?;
        (self.f)(value).await
    }
}

/// Registry of task handlers, keyed by task name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler object for a task name.
    pub fn register(&mut self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_name.into(), handler);
    }

    /// Register an async closure with typed payload decoding.
    pub fn on<T, F, Fut>(&mut self, task_name: impl Into<String>, f: F)
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.register(task_name, Arc::new(JsonHandler::new(f)));
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
