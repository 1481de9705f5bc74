//! Task coordination: submission, result tracking, retention, and recurring schedules.

pub mod coordinator;
pub mod events;
pub mod ledger;
pub mod recurring;

pub use coordinator::{Coordinator, CoordinatorBuilder, TaskRequest, WaitOutcome};
pub use events::TaskEvent;
pub use ledger::{CleanupReport, Ledger, LedgerEntry, LedgerStats};
pub use recurring::{RecurringInfo, RecurringTask, Schedule};
