//! Worker system: queued task execution.
//!
//! Core components:
//! - `queue`: Priority queue (priority first, then submission order)
//! - `handler`: `TaskHandler` trait and the per-worker kind → handler table
//! - `worker`: Worker lifecycle and processing loop

pub mod handler;
pub mod queue;
pub mod worker;

pub use handler::{BUILTIN_KINDS, HandlerRegistry, TaskHandler, handler_fn};
pub use queue::{QueuedTask, TaskQueue};
pub use worker::{ReportSender, TaskReport, Worker, WorkerInfo};
