//! Task ledger: status and outcome by task id.
//!
//! Owned by the coordinator behind its state mutex. Workers never touch it;
//! their reports are applied here by the drain loop.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::{Payload, Task, TaskId, TaskStatus};
use crate::worker::TaskReport;

/// One ledger record.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub status: TaskStatus,
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker or service the task was delivered to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn new(task: Task) -> Self {
        Self {
            status: task.status,
            created_at: task.created_at,
            completed_at: task.completed_at,
            result: task.result.clone(),
            error: task.error.clone(),
            destination: None,
            task,
        }
    }

    fn sync_from_task(&mut self) {
        self.status = self.task.status;
        self.result = self.task.result.clone();
        self.error = self.task.error.clone();
        self.completed_at = self.task.completed_at;
    }
}

/// Counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Terminal entries past the retention window.
    pub expired: Vec<TaskId>,
    /// Entries removed to get back under the size cap, of any status.
    pub evicted: Vec<TaskId>,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.expired.len() + self.evicted.len()
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<TaskId, LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly submitted task.
    pub fn insert(&mut self, task: Task) {
        self.entries.insert(task.id, LedgerEntry::new(task));
    }

    /// Insert a pre-built entry as-is.
    pub fn insert_entry(&mut self, entry: LedgerEntry) {
        self.entries.insert(entry.task.id, entry);
    }

    pub fn get(&self, id: &TaskId) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_destination(&mut self, id: &TaskId, destination: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.destination = Some(destination.to_string());
        }
    }

    /// Apply a worker report. Returns the new status if the entry moved
    /// forward; stale, duplicate, or orphaned reports are ignored.
    pub fn apply(&mut self, report: &TaskReport) -> Option<TaskStatus> {
        let entry = self.entries.get_mut(&report.task_id)?;
        let task = &mut entry.task;

        let applied = match report.status {
            TaskStatus::Processing if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Processing;
                task.started_at = Some(report.at.max(task.created_at));
                true
            }
            TaskStatus::Completed | TaskStatus::Failed if !task.status.is_terminal() => {
                if task.started_at.is_none() {
                    task.started_at = Some(report.at.max(task.created_at));
                }
                task.status = report.status;
                task.result = report.result.clone();
                task.error = report.error.clone();
                task.completed_at = Some(report.at.max(task.started_at.unwrap_or(task.created_at)));
                true
            }
            _ => false,
        };

        if !applied {
            return None;
        }
        if entry.destination.is_none() {
            entry.destination = Some(report.worker_id.clone());
        }
        entry.sync_from_task();
        Some(entry.status)
    }

    /// Replace an entry with a task that finished elsewhere (inline service,
    /// routing failure). Ignored if the entry was evicted or is already terminal.
    pub fn record_finished(&mut self, task: Task) -> bool {
        match self.entries.get_mut(&task.id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.task = task;
                entry.sync_from_task();
                true
            }
            _ => false,
        }
    }

    /// Mark a non-terminal entry failed.
    pub fn fail(&mut self, id: &TaskId, error: &str) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.task.fail(error).is_err() {
            return false;
        }
        entry.sync_from_task();
        true
    }

    /// Two passes: drop terminal entries older than `retention`, then evict
    /// the oldest entries (any status) until at most `max_tasks` remain.
    pub fn cleanup(
        &mut self,
        now: DateTime<Utc>,
        retention: Duration,
        max_tasks: usize,
    ) -> CleanupReport {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let mut report = CleanupReport::default();

        self.entries.retain(|id, entry| {
            let stale =
                entry.status.is_terminal() && now.signed_duration_since(entry.created_at) > retention;
            if stale {
                report.expired.push(*id);
            }
            !stale
        });

        if self.entries.len() > max_tasks {
            let mut by_age: Vec<(DateTime<Utc>, TaskId)> = self
                .entries
                .iter()
                .map(|(id, entry)| (entry.created_at, *id))
                .collect();
            by_age.sort();
            let excess = self.entries.len() - max_tasks;
            for (_, id) in by_age.into_iter().take(excess) {
                self.entries.remove(&id);
                report.evicted.push(id);
            }
        }

        report
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn entry_aged(age: chrono::Duration, status: TaskStatus) -> LedgerEntry {
        let mut task = Task::new("ping", Payload::new());
        task.created_at = Utc::now() - age;
        match status {
            TaskStatus::Pending => {}
            TaskStatus::Processing => task.start().unwrap(),
            TaskStatus::Completed => {
                task.start().unwrap();
                task.complete(Payload::new()).unwrap();
            }
            TaskStatus::Failed => task.fail("x").unwrap(),
        }
        LedgerEntry::new(task)
    }

    fn report(task_id: TaskId, status: TaskStatus) -> TaskReport {
        TaskReport {
            task_id,
            worker_id: "w1".into(),
            status,
            result: (status == TaskStatus::Completed).then(Payload::new),
            error: (status == TaskStatus::Failed).then(|| "boom".to_string()),
            at: Utc::now(),
        }
    }

    #[test]
    fn cleanup_removes_exactly_stale_terminal_entries() {
        let mut ledger = Ledger::new();
        let mut stale = Vec::new();
        for i in 0..1000 {
            let status = if i % 2 == 0 { TaskStatus::Completed } else { TaskStatus::Failed };
            ledger.insert_entry(entry_aged(chrono::Duration::minutes(i), status));
        }
        for i in 0..500 {
            let entry = entry_aged(chrono::Duration::hours(25) + chrono::Duration::minutes(i), TaskStatus::Completed);
            stale.push(entry.task.id);
            ledger.insert_entry(entry);
        }
        assert_eq!(ledger.len(), 1500);

        let report = ledger.cleanup(Utc::now(), DAY, 1000);
        assert_eq!(report.expired.len(), 500);
        assert!(report.evicted.is_empty());
        assert_eq!(ledger.len(), 1000);
        assert!(stale.iter().all(|id| !ledger.contains(id)));
    }

    #[test]
    fn cleanup_keeps_old_pending_within_cap() {
        let mut ledger = Ledger::new();
        let old = entry_aged(chrono::Duration::hours(48), TaskStatus::Pending);
        let id = old.task.id;
        ledger.insert_entry(old);

        let report = ledger.cleanup(Utc::now(), DAY, 10);
        assert_eq!(report.removed(), 0);
        assert!(ledger.contains(&id));
    }

    #[test]
    fn cleanup_evicts_oldest_regardless_of_status() {
        let mut ledger = Ledger::new();
        let oldest = entry_aged(chrono::Duration::minutes(30), TaskStatus::Pending);
        let middle = entry_aged(chrono::Duration::minutes(20), TaskStatus::Processing);
        let newest = entry_aged(chrono::Duration::minutes(10), TaskStatus::Completed);
        let (oldest_id, middle_id, newest_id) = (oldest.task.id, middle.task.id, newest.task.id);
        for e in [newest, oldest, middle] {
            ledger.insert_entry(e);
        }

        let report = ledger.cleanup(Utc::now(), DAY, 1);
        assert_eq!(report.evicted, vec![oldest_id, middle_id]);
        assert!(ledger.contains(&newest_id));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn apply_moves_forward_only() {
        let mut ledger = Ledger::new();
        let task = Task::new("ping", Payload::new());
        let id = task.id;
        ledger.insert(task);

        assert_eq!(ledger.apply(&report(id, TaskStatus::Processing)), Some(TaskStatus::Processing));
        assert_eq!(ledger.get(&id).unwrap().destination.as_deref(), Some("w1"));
        assert_eq!(ledger.apply(&report(id, TaskStatus::Processing)), None);
        assert_eq!(ledger.apply(&report(id, TaskStatus::Completed)), Some(TaskStatus::Completed));
        assert_eq!(ledger.apply(&report(id, TaskStatus::Failed)), None);

        let entry = ledger.get(&id).unwrap();
        assert_eq!(entry.status, TaskStatus::Completed);
        assert!(entry.error.is_none());
        assert!(entry.completed_at.unwrap() >= entry.task.started_at.unwrap());
    }

    #[test]
    fn apply_ignores_unknown_task() {
        let mut ledger = Ledger::new();
        let orphan = Task::new("ping", Payload::new());
        assert_eq!(ledger.apply(&report(orphan.id, TaskStatus::Completed)), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn record_finished_respects_terminal() {
        let mut ledger = Ledger::new();
        let mut task = Task::new("price", Payload::new());
        ledger.insert(task.clone());

        task.start().unwrap();
        task.complete(Payload::new()).unwrap();
        assert!(ledger.record_finished(task.clone()));
        assert_eq!(ledger.get(&task.id).unwrap().status, TaskStatus::Completed);

        assert!(!ledger.record_finished(task.clone()));
        assert!(!ledger.fail(&task.id, "late"));
    }

    #[test]
    fn stats_by_status() {
        let mut ledger = Ledger::new();
        ledger.insert_entry(entry_aged(chrono::Duration::zero(), TaskStatus::Pending));
        ledger.insert_entry(entry_aged(chrono::Duration::zero(), TaskStatus::Processing));
        ledger.insert_entry(entry_aged(chrono::Duration::zero(), TaskStatus::Completed));
        ledger.insert_entry(entry_aged(chrono::Duration::zero(), TaskStatus::Failed));
        ledger.insert_entry(entry_aged(chrono::Duration::zero(), TaskStatus::Failed));

        let stats = ledger.stats();
        assert_eq!(
            stats,
            LedgerStats {
                total: 5,
                pending: 1,
                processing: 1,
                completed: 1,
                failed: 2,
            }
        );
    }
}
