//! Task model and lifecycle state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Opaque key/value payload understood only by the eventual handler.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Task identifier.
pub type TaskId = Uuid;

/// Task priority. Higher values dequeue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, not yet picked up.
    Pending,
    /// A worker or service is executing it.
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID, never reused.
    pub id: TaskId,
    /// Operation requested.
    pub kind: String,
    /// Handler-specific arguments.
    #[serde(default)]
    pub payload: Payload,
    pub priority: TaskPriority,
    /// Worker that requested this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Worker this task must be delivered to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a pending task with medium priority.
    pub fn new(kind: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            priority: TaskPriority::default(),
            source: None,
            target: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                state: self.status,
                target,
            });
        }
        self.status = target;
        Ok(())
    }

    /// Leave `pending` and record the start time.
    pub fn start(&mut self) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Processing)?;
        self.started_at = Some(Utc::now().max(self.created_at));
        Ok(())
    }

    /// Record a successful terminal outcome.
    pub fn complete(&mut self, result: Payload) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Completed)?;
        self.result = Some(result);
        self.stamp_completion();
        Ok(())
    }

    /// Record a failed terminal outcome.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.stamp_completion();
        Ok(())
    }

    // Wall clock can step backwards; keep timestamps ordered.
    fn stamp_completion(&mut self) {
        let floor = self.started_at.unwrap_or(self.created_at);
        self.completed_at = Some(Utc::now().max(floor));
    }

    /// Time spent executing, if the task has started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or_default()
        })
    }

    /// Serialize into a plain mapping for cross-boundary transport.
    pub fn to_map(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }

    /// Rebuild a task from a mapping produced by [`Task::to_map`].
    pub fn from_map(map: Payload) -> Result<Self, TaskError> {
        Ok(serde_json::from_value(serde_json::Value::Object(map))?)
    }
}
