//! Task lifecycle events broadcast to subscribers.

use serde::Serialize;

use crate::task::{TaskId, TaskStatus};

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A change visible in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted {
        task_id: TaskId,
        kind: String,
    },
    Processing {
        task_id: TaskId,
        destination: String,
    },
    Completed {
        task_id: TaskId,
    },
    Failed {
        task_id: TaskId,
        error: String,
    },
    /// Removed by cleanup; later lookups report it as unknown.
    Evicted {
        task_id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Submitted { task_id, .. }
            | Self::Processing { task_id, .. }
            | Self::Completed { task_id }
            | Self::Failed { task_id, .. }
            | Self::Evicted { task_id } => *task_id,
        }
    }

    /// Build the event for a ledger status change.
    pub fn for_status(
        task_id: TaskId,
        status: TaskStatus,
        destination: &str,
        error: Option<&str>,
    ) -> Option<Self> {
        match status {
            TaskStatus::Pending => None,
            TaskStatus::Processing => Some(Self::Processing {
                task_id,
                destination: destination.to_string(),
            }),
            TaskStatus::Completed => Some(Self::Completed { task_id }),
            TaskStatus::Failed => Some(Self::Failed {
                task_id,
                error: error.unwrap_or_default().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(TaskEvent::Failed {
            task_id: id,
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(value["type"], json!("failed"));
        assert_eq!(value["task_id"], json!(id.to_string()));
    }

    #[test]
    fn pending_has_no_event() {
        assert!(TaskEvent::for_status(Uuid::new_v4(), TaskStatus::Pending, "w", None).is_none());
    }
}
