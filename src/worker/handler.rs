//! Kind-to-handler dispatch table for workers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::task::{Payload, Task};

/// Kinds answered by every worker without consulting its handler table.
pub const BUILTIN_KINDS: &[&str] = &["ping", "status"];

/// Domain logic for one task kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task, returning a result payload or an error carried as data.
    async fn handle(&self, task: &Task) -> Result<Payload, HandlerError>;
}

/// Adapter that turns an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    async fn handle(&self, task: &Task) -> Result<Payload, HandlerError> {
        (self.0)(task.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers registered for a worker, keyed by task kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Built-in kinds cannot be shadowed.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let kind = kind.into();
        if BUILTIN_KINDS.contains(&kind.as_str()) {
            tracing::warn!(kind = %kind, "Rejected handler registration: would shadow a built-in kind");
            return;
        }
        tracing::debug!("Registered handler: {}", kind);
        self.handlers.insert(kind, handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
