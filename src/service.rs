//! Synchronous services invoked inline, bypassing worker queues.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::HandlerError;
use crate::task::{Payload, Task};
use crate::worker::worker::panic_message;

/// A component that answers requests on the caller's task.
///
/// Implementations must not block indefinitely: `submit` does not return
/// until `process` does.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Service name, for logs and introspection.
    fn name(&self) -> &str;

    /// Handle one request.
    async fn process(&self, payload: Payload) -> Result<Payload, HandlerError>;
}

/// Services registered by task kind.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn SyncService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` for every kind in `kinds`. A later registration
    /// for the same kind replaces the earlier one.
    pub fn register<I, S>(&mut self, kinds: I, service: Arc<dyn SyncService>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for kind in kinds {
            let kind = kind.into();
            if let Some(previous) = self.services.insert(kind.clone(), service.clone()) {
                tracing::warn!(
                    kind = %kind,
                    previous = previous.name(),
                    replacement = service.name(),
                    "Replaced synchronous service"
                );
            }
            tracing::debug!(kind = %kind, service = service.name(), "Registered service");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn SyncService>> {
        self.services.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.services.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.services.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Inline destination: runs a [`SyncService`] and finishes the task on the spot.
#[derive(Clone)]
pub struct SyncHandler {
    service: Arc<dyn SyncService>,
}

impl SyncHandler {
    pub fn new(service: Arc<dyn SyncService>) -> Self {
        Self { service }
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    /// Execute the task and return it in a terminal state.
    ///
    /// Service errors and panics become a failed task.
    pub async fn call(&self, mut task: Task) -> Task {
        if let Err(e) = task.start() {
            tracing::warn!(task_id = %task.id, "Cannot start task inline: {}", e);
            return task;
        }

        let outcome = AssertUnwindSafe(self.service.process(task.payload.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::Panicked {
                    kind: task.kind.clone(),
                    message: panic_message(panic.as_ref()),
                })
            });

        // Both transitions are valid from Processing.
        let _ = match outcome {
            Ok(result) => task.complete(result),
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    service = self.service.name(),
                    "Inline service failed: {}", e
                );
                task.fail(e.to_string())
            }
        };
        task
    }
}
