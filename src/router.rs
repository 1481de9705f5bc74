//! Task routing: target → service → route table → capability scan.

use std::sync::Arc;

use tracing::debug;

use crate::config::RouteTable;
use crate::error::{RoutingError, WorkerError};
use crate::service::{ServiceRegistry, SyncHandler};
use crate::task::Task;
use crate::worker::Worker;

/// Where a task goes.
#[derive(Clone)]
pub enum Destination {
    /// Queued onto a worker's priority queue.
    Worker(Arc<Worker>),
    /// Executed inline on the submitter's task.
    Service(SyncHandler),
}

/// What happened when a task was handed to its destination.
#[derive(Debug)]
pub enum Delivery {
    /// Accepted by a worker queue; the outcome arrives later.
    Queued { worker: String },
    /// Already executed; the task is terminal.
    Finished(Task),
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Worker(_) => "Worker",
            Self::Service(_) => "Service",
        };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}

impl Destination {
    /// Name for logs and events.
    pub fn name(&self) -> &str {
        match self {
            Self::Worker(worker) => worker.id(),
            Self::Service(handler) => handler.name(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Service(_))
    }

    /// Hand the task over.
    pub async fn deliver(&self, task: Task) -> Result<Delivery, WorkerError> {
        match self {
            Self::Worker(worker) => {
                worker.enqueue(task)?;
                Ok(Delivery::Queued {
                    worker: worker.id().to_string(),
                })
            }
            Self::Service(handler) => Ok(Delivery::Finished(handler.call(task).await)),
        }
    }
}

/// Resolves tasks to destinations. Immutable once built.
pub struct Router {
    workers: Vec<Arc<Worker>>,
    services: ServiceRegistry,
    routes: RouteTable,
}

impl Router {
    /// `workers` are scanned in the order given.
    pub fn new(workers: Vec<Arc<Worker>>, services: ServiceRegistry, routes: RouteTable) -> Self {
        Self {
            workers,
            services,
            routes,
        }
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn worker(&self, id: &str) -> Option<&Arc<Worker>> {
        self.workers.iter().find(|w| w.id() == id)
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Pick the destination for `task`. First match wins:
    /// explicit target worker, inline service, route table, capability scan.
    ///
    /// A route-table hit only counts if a worker of the mapped kind also
    /// accepts the task kind.
    pub fn resolve(&self, task: &Task) -> Result<Destination, RoutingError> {
        if let Some(target) = task.target.as_deref() {
            if let Some(worker) = self.worker(target) {
                debug!(task_id = %task.id, worker = %target, "Routed by target");
                return Ok(Destination::Worker(worker.clone()));
            }
            debug!(task_id = %task.id, target = %target, "Unknown target, falling through");
        }

        if let Some(service) = self.services.get(&task.kind) {
            debug!(task_id = %task.id, service = service.name(), "Routed to inline service");
            return Ok(Destination::Service(SyncHandler::new(service)));
        }

        if let Some(worker_kind) = self.routes.worker_kind(&task.kind)
            && let Some(worker) = self
                .workers
                .iter()
                .find(|w| w.kind() == worker_kind && w.supports(&task.kind))
        {
            debug!(task_id = %task.id, worker = worker.id(), "Routed by route table");
            return Ok(Destination::Worker(worker.clone()));
        }

        if let Some(worker) = self.workers.iter().find(|w| w.supports(&task.kind)) {
            debug!(task_id = %task.id, worker = worker.id(), "Routed by capability");
            return Ok(Destination::Worker(worker.clone()));
        }

        Err(RoutingError::NoDestination {
            kind: task.kind.clone(),
        })
    }
}
