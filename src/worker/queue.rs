//! Per-worker priority queue.
//!
//! Ordering is priority first, then submission order among equal priorities.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::task::{Task, TaskPriority};

/// A task together with its queue position.
pub struct QueuedTask {
    priority: TaskPriority,
    seq: u64,
    task: Task,
}

impl QueuedTask {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority wins, then the lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Single-consumer priority queue with async wake-up.
pub struct TaskQueue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    next_seq: AtomicU64,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<QueuedTask>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a task and wake the consumer.
    pub fn push(&self, task: Task) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap().push(QueuedTask {
            priority: task.priority,
            seq,
            task,
        });
        self.notify.notify_one();
    }

    /// Put back a task taken with [`pop_timeout`](Self::pop_timeout),
    /// keeping its original position.
    pub fn requeue(&self, queued: QueuedTask) {
        self.heap().push(queued);
        self.notify.notify_one();
    }

    /// Remove the highest-priority task, if any.
    pub fn pop(&self) -> Option<Task> {
        self.heap().pop().map(QueuedTask::into_task)
    }

    /// Wait up to `timeout` for a task. Returns `None` on timeout or wake-up
    /// with an empty queue.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<QueuedTask> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(queued) = self.heap().pop() {
                return Some(queued);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.heap().pop();
            }
            // A wake-up with nothing queued means someone wants the consumer
            // to re-check its running flag.
            if self.is_empty() {
                return None;
            }
        }
    }

    /// Wake the consumer without enqueuing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Drop every queued task, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut heap = self.heap();
        let dropped = heap.len();
        heap.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
