//! Error types for agent dispatch.

use std::time::Duration;

use uuid::Uuid;

use crate::task::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// No route, or the chosen worker refused the task. The ledger entry
    /// is already marked failed.
    #[error("Task {task_id} could not be delivered: {reason}")]
    Undeliverable { task_id: Uuid, reason: String },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task lifecycle and (de)serialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: TaskStatus,
        target: TaskStatus,
    },

    #[error("Malformed task mapping: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Worker-side errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {worker} does not support task kind '{kind}'")]
    UnsupportedKind { worker: String, kind: String },

    #[error("Worker {worker} did not stop within {timeout:?}")]
    StopTimeout { worker: String, timeout: Duration },
}

/// Failure to find a destination for a task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoutingError {
    #[error("No worker or service can handle task kind '{kind}'")]
    NoDestination { kind: String },
}

/// Failure reported by a task handler or synchronous service.
///
/// Carried as data into the ledger; never propagated to other tasks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler for '{kind}' failed: {reason}")]
    Failed { kind: String, reason: String },

    #[error("Invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Handler for '{kind}' panicked: {message}")]
    Panicked { kind: String, message: String },

    #[error("No handler registered for '{kind}'")]
    NotRegistered { kind: String },
}

impl HandlerError {
    /// Shorthand for the common failure case.
    pub fn failed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for payload validation failures.
    pub fn invalid_payload(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

/// Recurring schedule errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Interval must be greater than zero")]
    ZeroInterval,

    #[error("Invalid interval of {secs} seconds: {reason}")]
    InvalidInterval { secs: f64, reason: String },

    #[error("Schedule {id} not found")]
    NotFound { id: Uuid },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
