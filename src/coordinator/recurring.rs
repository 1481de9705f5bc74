//! Recurring task specs materialized by the scheduler tick.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::task::{Payload, Task, TaskPriority};

/// When a recurring spec fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed interval, measured on the tick clock.
    Every(Duration),
    /// Cron expression (seconds field included), evaluated in UTC.
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Schedule {
    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Self::Every(interval))
    }

    /// Interval from fractional seconds, as accepted over the API.
    pub fn every_secs(secs: f64) -> Result<Self, ScheduleError> {
        let interval =
            Duration::try_from_secs_f64(secs).map_err(|e| ScheduleError::InvalidInterval {
                secs,
                reason: e.to_string(),
            })?;
        Self::every(interval)
    }

    pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
        let schedule =
            cron::Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Every(interval) => format!("every {}s", interval.as_secs_f64()),
            Self::Cron { expression, .. } => format!("cron {expression}"),
        }
    }
}

/// A template the scheduler turns into tasks.
#[derive(Debug, Clone)]
pub struct RecurringTask {
    pub id: Uuid,
    pub kind: String,
    pub payload: Payload,
    pub priority: TaskPriority,
    pub schedule: Schedule,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    last_tick: Option<Instant>,
}

impl RecurringTask {
    pub fn new(
        kind: impl Into<String>,
        payload: Payload,
        schedule: Schedule,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            priority,
            schedule,
            last_run_at: None,
            run_count: 0,
            created_at: Utc::now(),
            last_tick: None,
        }
    }

    /// Whether the spec should fire on the tick scheduled at `tick`.
    ///
    /// Intervals compare tick instants, which sit on a fixed grid, so a late
    /// wake-up never makes a spec skip a beat. A spec that never ran is due.
    pub fn is_due(&self, tick: Instant, now: DateTime<Utc>) -> bool {
        match &self.schedule {
            Schedule::Every(interval) => self
                .last_tick
                .is_none_or(|last| tick.saturating_duration_since(last) >= *interval),
            Schedule::Cron { schedule, .. } => {
                let after = self.last_run_at.unwrap_or(self.created_at);
                schedule.after(&after).next().is_some_and(|next| next <= now)
            }
        }
    }

    pub fn mark_run(&mut self, tick: Instant, now: DateTime<Utc>) {
        self.last_tick = Some(tick);
        self.last_run_at = Some(now);
        self.run_count += 1;
    }

    /// Build a fresh task from this spec. The payload is forwarded verbatim.
    pub fn materialize(&self) -> Task {
        Task::new(self.kind.clone(), self.payload.clone())
            .with_priority(self.priority)
            .with_source(format!("schedule:{}", self.id))
    }

    pub fn info(&self) -> RecurringInfo {
        RecurringInfo {
            id: self.id,
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            schedule: self.schedule.describe(),
            last_run_at: self.last_run_at,
            run_count: self.run_count,
        }
    }
}

/// Serializable snapshot of a recurring spec.
#[derive(Debug, Clone, Serialize)]
pub struct RecurringInfo {
    pub id: Uuid,
    pub kind: String,
    pub payload: Payload,
    pub priority: TaskPriority,
    pub schedule: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
}
