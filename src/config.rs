//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Ledger size cap enforced by cleanup.
    pub max_tasks: usize,
    /// Terminal entries older than this are removed by cleanup.
    pub retention: Duration,
    /// Submissions between automatic cleanup passes.
    pub cleanup_interval: usize,
    /// Drained terminal results between safety-net cleanup passes.
    pub drain_cleanup_every: usize,
    /// Poll interval for `wait_for_result`.
    pub result_poll_interval: Duration,
    /// Recurring scheduler resolution.
    pub tick_interval: Duration,
    /// How long a worker blocks on an empty queue per iteration.
    pub dequeue_timeout: Duration,
    /// Bounded wait when stopping workers and loops.
    pub stop_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_tasks: 1000,
            retention: Duration::from_secs(24 * 3600), // 24 hours
            cleanup_interval: 100,
            drain_cleanup_every: 20,
            result_poll_interval: Duration::from_millis(500),
            tick_interval: Duration::from_secs(1),
            dequeue_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    /// Load from `AGENT_DISPATCH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_tasks: env_parse("AGENT_DISPATCH_MAX_TASKS", defaults.max_tasks)?,
            retention: retention_from_hours(env_parse(
                "AGENT_DISPATCH_RETENTION_HOURS",
                24,
            )?)?,
            cleanup_interval: env_parse(
                "AGENT_DISPATCH_CLEANUP_INTERVAL",
                defaults.cleanup_interval,
            )?,
            drain_cleanup_every: env_parse(
                "AGENT_DISPATCH_DRAIN_CLEANUP_EVERY",
                defaults.drain_cleanup_every,
            )?,
            result_poll_interval: Duration::from_millis(env_parse(
                "AGENT_DISPATCH_RESULT_POLL_MS",
                500,
            )?),
            tick_interval: Duration::from_millis(env_parse(
                "AGENT_DISPATCH_TICK_INTERVAL_MS",
                1000,
            )?),
            dequeue_timeout: Duration::from_millis(env_parse(
                "AGENT_DISPATCH_DEQUEUE_TIMEOUT_MS",
                1000,
            )?),
            stop_timeout: Duration::from_secs(env_parse("AGENT_DISPATCH_STOP_TIMEOUT_SECS", 5)?),
        }
        .validated()?)
    }

    /// Reject values that would stall the loops.
    pub fn validated(self) -> Result<Self, ConfigError> {
        let zero = |key: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        };
        if self.max_tasks == 0 {
            return Err(zero("max_tasks"));
        }
        if self.tick_interval.is_zero() {
            return Err(zero("tick_interval"));
        }
        if self.result_poll_interval.is_zero() {
            return Err(zero("result_poll_interval"));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(zero("dequeue_timeout"));
        }
        Ok(self)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory for daily-rotated log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_parse("AGENT_DISPATCH_PORT", 8080)?,
            log_dir: std::env::var("AGENT_DISPATCH_LOG_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

/// Static task-kind → worker-kind routing table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, task_kind: impl Into<String>, worker_kind: impl Into<String>) -> Self {
        self.insert(task_kind, worker_kind);
        self
    }

    pub fn insert(&mut self, task_kind: impl Into<String>, worker_kind: impl Into<String>) {
        self.routes.insert(task_kind.into(), worker_kind.into());
    }

    pub fn worker_kind(&self, task_kind: &str) -> Option<&str> {
        self.routes.get(task_kind).map(String::as_str)
    }

    /// Parse `task_kind=worker_kind` pairs separated by commas,
    /// e.g. `trade=trading,remember=memory`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        for pair in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (task_kind, worker_kind) =
                pair.split_once('=')
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: "routes".to_string(),
                        message: format!("expected task_kind=worker_kind, got '{pair}'"),
                    })?;
            table.insert(task_kind.trim(), worker_kind.trim());
        }
        Ok(table)
    }

    /// Load from `AGENT_DISPATCH_ROUTES`, empty if unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("AGENT_DISPATCH_ROUTES") {
            Ok(spec) => Self::parse(&spec),
            Err(_) => Ok(Self::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn retention_from_hours(hours: u64) -> Result<Duration, ConfigError> {
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "AGENT_DISPATCH_RETENTION_HOURS".to_string(),
            message: format!("{hours} hours is out of range"),
        })
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
