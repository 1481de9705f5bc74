//! Queued worker with a dedicated processing loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HandlerError, WorkerError};
use crate::task::{Payload, Task, TaskId, TaskStatus};
use crate::worker::handler::{BUILTIN_KINDS, HandlerRegistry};
use crate::worker::queue::TaskQueue;

/// Default time the loop blocks on an empty queue before re-checking `running`.
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on how long `stop()` waits for the loop to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome notification sent from a worker to the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub worker_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskReport {
    fn from_task(task: &Task, worker_id: &str) -> Self {
        Self {
            task_id: task.id,
            worker_id: worker_id.to_string(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            at: task
                .completed_at
                .or(task.started_at)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Sender half of the shared result channel.
pub type ReportSender = mpsc::UnboundedSender<TaskReport>;

/// Snapshot of a worker for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub kind: String,
    pub capabilities: Vec<String>,
    pub running: bool,
    pub queue_depth: usize,
    pub processed: u64,
    pub failed: u64,
}

/// A named processing unit bound to a set of task kinds.
///
/// Tasks are executed one at a time in priority order. Outcomes are
/// reported only through the shared result channel.
pub struct Worker {
    id: String,
    kind: String,
    handlers: HandlerRegistry,
    queue: TaskQueue,
    results: ReportSender,
    running: AtomicBool,
    /// Bumped on every start so a loop left over from a timed-out stop retires.
    generation: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
    dequeue_timeout: Duration,
    stop_timeout: Duration,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Worker {
    /// Create an idle worker.
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        handlers: HandlerRegistry,
        results: ReportSender,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            handlers,
            queue: TaskQueue::new(),
            results,
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            handle: Mutex::new(None),
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_timeouts(mut self, dequeue_timeout: Duration, stop_timeout: Duration) -> Self {
        self.dequeue_timeout = dequeue_timeout;
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether this worker accepts tasks of `kind`.
    pub fn supports(&self, kind: &str) -> bool {
        BUILTIN_KINDS.contains(&kind) || self.handlers.contains(kind)
    }

    /// All accepted kinds, built-ins first.
    pub fn capabilities(&self) -> Vec<String> {
        BUILTIN_KINDS
            .iter()
            .copied()
            .chain(self.handlers.kinds())
            .map(str::to_string)
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            kind: self.kind.clone(),
            capabilities: self.capabilities(),
            running: self.is_running(),
            queue_depth: self.queue.len(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Queue a task. Kinds outside the capability set are rejected.
    pub fn enqueue(&self, task: Task) -> Result<(), WorkerError> {
        if !self.supports(&task.kind) {
            return Err(WorkerError::UnsupportedKind {
                worker: self.id.clone(),
                kind: task.kind,
            });
        }
        debug!(
            worker = %self.id,
            task_id = %task.id,
            kind = %task.kind,
            priority = %task.priority,
            "Task enqueued"
        );
        self.queue.push(task);
        Ok(())
    }

    /// Spawn the processing loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(worker = %self.id, "Worker already running");
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            worker.run(generation).await;
        }));
        info!(worker = %self.id, kind = %self.kind, "Worker started");
    }

    /// Signal the loop to exit and wait a bounded time for it.
    ///
    /// The in-flight task (if any) is allowed to finish. Tasks still queued
    /// are dropped. On timeout the loop is left to finish on its own.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.running.store(false, Ordering::SeqCst);
        self.queue.wake();

        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        let joined = match handle {
            Some(handle) => tokio::time::timeout(self.stop_timeout, handle).await.is_ok(),
            None => true,
        };

        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!(worker = %self.id, dropped, "Dropped queued tasks on stop");
        }

        if joined {
            info!(worker = %self.id, "Worker stopped");
            Ok(())
        } else {
            warn!(worker = %self.id, timeout = ?self.stop_timeout, "Worker loop did not exit in time");
            Err(WorkerError::StopTimeout {
                worker: self.id.clone(),
                timeout: self.stop_timeout,
            })
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    async fn run(self: Arc<Self>, generation: u64) {
        debug!(worker = %self.id, generation, "Worker loop entered");
        while self.is_current(generation) {
            let Some(queued) = self.queue.pop_timeout(self.dequeue_timeout).await else {
                continue;
            };
            if !self.is_current(generation) {
                self.queue.requeue(queued);
                break;
            }
            self.process(queued.into_task()).await;
        }
        debug!(worker = %self.id, generation, "Worker loop exited");
    }

    async fn process(&self, mut task: Task) {
        if let Err(e) = task.start() {
            warn!(worker = %self.id, task_id = %task.id, "Skipping task: {}", e);
            return;
        }
        self.report(TaskReport::from_task(&task, &self.id));

        let outcome = AssertUnwindSafe(self.dispatch(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::Panicked {
                    kind: task.kind.clone(),
                    message: panic_message(panic.as_ref()),
                })
            });

        let transition = match outcome {
            Ok(result) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                task.complete(result)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.id, task_id = %task.id, kind = %task.kind, "Task failed: {}", e);
                task.fail(e.to_string())
            }
        };
        if let Err(e) = transition {
            warn!(worker = %self.id, task_id = %task.id, "Invalid task transition: {}", e);
            return;
        }

        debug!(
            worker = %self.id,
            task_id = %task.id,
            status = %task.status,
            elapsed_ms = task.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0),
            "Task finished"
        );
        self.report(TaskReport::from_task(&task, &self.id));
    }

    async fn dispatch(&self, task: &Task) -> Result<Payload, HandlerError> {
        match task.kind.as_str() {
            "ping" => {
                let mut out = Payload::new();
                out.insert("pong".into(), true.into());
                out.insert("worker".into(), self.id.clone().into());
                Ok(out)
            }
            "status" => match serde_json::to_value(self.info()) {
                Ok(serde_json::Value::Object(map)) => Ok(map),
                _ => Err(HandlerError::failed("status", "could not serialize worker info")),
            },
            kind => match self.handlers.get(kind) {
                Some(handler) => handler.handle(task).await,
                None => Err(HandlerError::NotRegistered {
                    kind: kind.to_string(),
                }),
            },
        }
    }

    fn report(&self, report: TaskReport) {
        if self.results.send(report).is_err() {
            warn!(worker = %self.id, "Result channel closed, dropping report");
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
