//! Coordinator: owns workers, the ledger, retention, and recurring tasks.
//!
//! The coordinator runs two background loops next to the worker loops:
//! - a **drain loop** applying worker reports to the ledger
//! - a **tick loop** materializing due recurring specs
//!
//! Ledger and recurring specs share one mutex. It is never held across a
//! service call or a worker handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CoordinatorConfig, RouteTable};
use crate::coordinator::events::{DEFAULT_EVENT_CAPACITY, TaskEvent};
use crate::coordinator::ledger::{CleanupReport, Ledger, LedgerEntry, LedgerStats};
use crate::coordinator::recurring::{RecurringInfo, RecurringTask, Schedule};
use crate::error::{Error, Result, ScheduleError};
use crate::router::{Delivery, Router};
use crate::service::{ServiceRegistry, SyncService};
use crate::task::{Payload, Task, TaskId, TaskPriority, TaskStatus};
use crate::worker::{HandlerRegistry, ReportSender, TaskReport, Worker, WorkerInfo};

/// A submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

impl TaskRequest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
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

    fn into_task(self) -> Task {
        let mut task = Task::new(self.kind, self.payload).with_priority(self.priority);
        task.source = self.source;
        task.target = self.target;
        task
    }
}

/// What `wait_for_result` observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WaitOutcome {
    Completed { result: Payload },
    Failed { error: String },
    /// Gave up waiting. The task itself is unaffected.
    Timeout,
    /// No ledger entry: never submitted or evicted by cleanup.
    Unknown,
}

impl WaitOutcome {
    fn from_entry(entry: Option<&LedgerEntry>) -> Option<Self> {
        let Some(entry) = entry else {
            return Some(Self::Unknown);
        };
        match entry.status {
            TaskStatus::Completed => Some(Self::Completed {
                result: entry.result.clone().unwrap_or_default(),
            }),
            TaskStatus::Failed => Some(Self::Failed {
                error: entry.error.clone().unwrap_or_default(),
            }),
            TaskStatus::Pending | TaskStatus::Processing => None,
        }
    }
}

/// State guarded by the coordinator mutex.
#[derive(Default)]
struct State {
    ledger: Ledger,
    recurring: Vec<RecurringTask>,
    submitted_since_cleanup: usize,
    drained_since_cleanup: usize,
}

/// Builder for [`Coordinator`]. Workers are scanned in the order added.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    results_tx: ReportSender,
    results_rx: mpsc::UnboundedReceiver<TaskReport>,
    workers: Vec<Arc<Worker>>,
    services: ServiceRegistry,
    routes: RouteTable,
}

impl CoordinatorBuilder {
    /// Add a worker built from a handler table.
    pub fn worker(
        self,
        id: impl Into<String>,
        kind: impl Into<String>,
        handlers: HandlerRegistry,
    ) -> Self {
        let worker = Worker::new(id, kind, handlers, self.results_tx.clone())
            .with_timeouts(self.config.dequeue_timeout, self.config.stop_timeout);
        self.add_worker(Arc::new(worker))
    }

    /// Add a pre-built worker. It must report on [`result_sender`](Self::result_sender).
    pub fn add_worker(mut self, worker: Arc<Worker>) -> Self {
        if self.workers.iter().any(|w| w.id() == worker.id()) {
            warn!(worker = %worker.id(), "Duplicate worker id, ignoring");
            return self;
        }
        self.workers.push(worker);
        self
    }

    /// Sender for the shared result channel.
    pub fn result_sender(&self) -> ReportSender {
        self.results_tx.clone()
    }

    /// Register an inline service for `kinds`.
    pub fn service<I, S>(mut self, kinds: I, service: Arc<dyn SyncService>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.register(kinds, service);
        self
    }

    pub fn route(mut self, task_kind: impl Into<String>, worker_kind: impl Into<String>) -> Self {
        self.routes.insert(task_kind, worker_kind);
        self
    }

    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn build(self) -> Arc<Coordinator> {
        for kind in self.services.kinds() {
            if let Some(worker) = self.workers.iter().find(|w| w.supports(&kind)) {
                warn!(
                    kind = %kind,
                    worker = %worker.id(),
                    "Kind has both an inline service and a worker handler; the service wins unless a task targets the worker"
                );
            }
        }

        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Arc::new(Coordinator {
            config: self.config,
            router: Router::new(self.workers, self.services, self.routes),
            state: Mutex::new(State::default()),
            _results_tx: self.results_tx,
            results_rx: Mutex::new(self.results_rx),
            events,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            drain_stop: Notify::new(),
            loops: StdMutex::new(Vec::new()),
        })
    }
}

/// Owns the workers, the ledger, and the recurring scheduler.
pub struct Coordinator {
    config: CoordinatorConfig,
    router: Router,
    state: Mutex<State>,
    /// Keeps the result channel open even with no workers.
    _results_tx: ReportSender,
    results_rx: Mutex<mpsc::UnboundedReceiver<TaskReport>>,
    events: broadcast::Sender<TaskEvent>,
    running: AtomicBool,
    /// Stops the tick loop.
    shutdown: Notify,
    /// Stops the drain loop once workers are down.
    drain_stop: Notify,
    loops: StdMutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        CoordinatorBuilder {
            config,
            results_tx,
            results_rx,
            workers: Vec::new(),
            services: ServiceRegistry::new(),
            routes: RouteTable::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start all workers, the drain loop, and the tick loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in self.router.workers() {
            worker.start();
        }
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move { this.drain_loop().await }));
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move { this.tick_loop().await }));
        info!(
            workers = self.router.workers().len(),
            services = self.router.services().len(),
            "Coordinator started"
        );
    }

    /// Stop loops and workers, each with a bounded wait.
    ///
    /// Workers stop first so reports from in-flight tasks still reach the
    /// ledger before the drain loop exits.
    pub async fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        for worker in self.router.workers() {
            if let Err(e) = worker.stop().await {
                warn!("{}", e);
            }
        }
        if was_running {
            self.drain_stop.notify_one();
        }

        let handles: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if tokio::time::timeout(self.config.stop_timeout, handle).await.is_err() {
                warn!(timeout = ?self.config.stop_timeout, "Coordinator loop did not exit in time");
            }
        }
        info!("Coordinator stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    fn emit(&self, event: TaskEvent) {
        // Fine if nobody is listening.
        let _ = self.events.send(event);
    }

    /// Subscribe to live task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Submit a task and return its id.
    ///
    /// Queued tasks return as soon as they are enqueued. Tasks routed to an
    /// inline service return only after the service has finished.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        self.submit_task(request.into_task()).await
    }

    async fn submit_task(&self, task: Task) -> Result<TaskId> {
        self.cleanup(false).await;

        let task_id = task.id;
        {
            let mut state = self.state.lock().await;
            state.ledger.insert(task.clone());
            state.submitted_since_cleanup += 1;
        }
        self.emit(TaskEvent::Submitted {
            task_id,
            kind: task.kind.clone(),
        });

        let destination = match self.router.resolve(&task) {
            Ok(destination) => destination,
            Err(e) => {
                warn!(task_id = %task_id, kind = %task.kind, "{}", e);
                return Err(self.reject(task_id, e.to_string()).await);
            }
        };

        let name = destination.name().to_string();
        self.state
            .lock()
            .await
            .ledger
            .set_destination(&task_id, &name);

        match destination.deliver(task).await {
            Ok(Delivery::Queued { worker }) => {
                debug!(task_id = %task_id, worker = %worker, "Task queued");
            }
            Ok(Delivery::Finished(task)) => {
                let status = task.status;
                let error = task.error.clone();
                let recorded = self.state.lock().await.ledger.record_finished(task);
                if recorded {
                    if let Some(event) =
                        TaskEvent::for_status(task_id, status, &name, error.as_deref())
                    {
                        self.emit(event);
                    }
                } else {
                    debug!(task_id = %task_id, "Inline result arrived after eviction");
                }
            }
            Err(e) => {
                warn!(task_id = %task_id, "{}", e);
                return Err(self.reject(task_id, e.to_string()).await);
            }
        }

        Ok(task_id)
    }

    async fn reject(&self, task_id: TaskId, reason: String) -> Error {
        if self.state.lock().await.ledger.fail(&task_id, &reason) {
            self.emit(TaskEvent::Failed {
                task_id,
                error: reason.clone(),
            });
        }
        Error::Undeliverable { task_id, reason }
    }

    /// Submit and block until the task finishes or `timeout` elapses.
    pub async fn submit_and_wait(
        &self,
        request: TaskRequest,
        timeout: Duration,
    ) -> Result<(TaskId, WaitOutcome)> {
        let task_id = self.submit(request).await?;
        Ok((task_id, self.wait_for_result(task_id, timeout).await))
    }

    /// Poll the ledger until the task is terminal, vanishes, or `timeout`
    /// elapses. Timing out does not touch the task.
    pub async fn wait_for_result(&self, task_id: TaskId, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let outcome = {
                let state = self.state.lock().await;
                WaitOutcome::from_entry(state.ledger.get(&task_id))
            };
            if let Some(outcome) = outcome {
                return outcome;
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Timeout;
            }
            tokio::time::sleep(self.config.result_poll_interval.min(deadline - now)).await;
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Snapshot of a ledger entry.
    pub async fn task(&self, task_id: TaskId) -> Option<LedgerEntry> {
        self.state.lock().await.ledger.get(&task_id).cloned()
    }

    pub async fn stats(&self) -> LedgerStats {
        self.state.lock().await.ledger.stats()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.router.workers().iter().map(|w| w.info()).collect()
    }

    pub fn worker(&self, id: &str) -> Option<Arc<Worker>> {
        self.router.worker(id).cloned()
    }

    // ── Retention ───────────────────────────────────────────────────────

    /// Remove stale terminal entries, then enforce the size cap.
    ///
    /// Without `force`, runs only once `cleanup_interval` submissions have
    /// accumulated since the previous pass.
    pub async fn cleanup(&self, force: bool) -> CleanupReport {
        let report = {
            let mut state = self.state.lock().await;
            if !force && state.submitted_since_cleanup < self.config.cleanup_interval {
                return CleanupReport::default();
            }
            state.submitted_since_cleanup = 0;
            state.drained_since_cleanup = 0;
            state
                .ledger
                .cleanup(Utc::now(), self.config.retention, self.config.max_tasks)
        };

        if !report.evicted.is_empty() {
            warn!(
                evicted = report.evicted.len(),
                max_tasks = self.config.max_tasks,
                "Ledger over capacity, evicted oldest tasks"
            );
        }
        if report.removed() > 0 {
            info!(
                expired = report.expired.len(),
                evicted = report.evicted.len(),
                "Ledger cleanup"
            );
        }
        for task_id in report.expired.iter().chain(&report.evicted) {
            self.emit(TaskEvent::Evicted { task_id: *task_id });
        }
        report
    }

    // ── Result drain ────────────────────────────────────────────────────

    async fn drain_loop(self: Arc<Self>) {
        let mut rx = self.results_rx.lock().await;
        debug!("Result drain loop started");

        loop {
            let received = tokio::select! {
                _ = self.drain_stop.notified() => break,
                received = rx.recv() => received,
            };
            match received {
                Some(report) => self.apply_report(report).await,
                None => {
                    error!("Result channel closed");
                    break;
                }
            }
        }

        let mut flushed = 0usize;
        while let Ok(report) = rx.try_recv() {
            self.apply_report(report).await;
            flushed += 1;
        }
        debug!(flushed, "Result drain loop exited");
    }

    async fn apply_report(&self, report: TaskReport) {
        let (applied, cleanup_due) = {
            let mut state = self.state.lock().await;
            let applied = state.ledger.apply(&report);
            let mut cleanup_due = false;
            if applied.is_some_and(|s| s.is_terminal()) {
                state.drained_since_cleanup += 1;
                cleanup_due = self.config.drain_cleanup_every > 0
                    && state.drained_since_cleanup >= self.config.drain_cleanup_every;
            }
            (applied, cleanup_due)
        };

        match applied {
            Some(status) => {
                if let Some(event) = TaskEvent::for_status(
                    report.task_id,
                    status,
                    &report.worker_id,
                    report.error.as_deref(),
                ) {
                    self.emit(event);
                }
            }
            None => debug!(task_id = %report.task_id, status = %report.status, "Ignored report"),
        }

        if cleanup_due {
            self.cleanup(true).await;
        }
    }

    // ── Recurring tasks ─────────────────────────────────────────────────

    /// Run `kind` every `interval`. The first run happens on the next tick.
    pub async fn schedule_recurring(
        &self,
        kind: impl Into<String>,
        payload: Payload,
        interval: Duration,
        priority: TaskPriority,
    ) -> std::result::Result<Uuid, ScheduleError> {
        let spec = RecurringTask::new(kind, payload, Schedule::every(interval)?, priority);
        Ok(self.add_schedule(spec).await)
    }

    /// Register a pre-built schedule.
    pub async fn schedule(
        &self,
        kind: impl Into<String>,
        payload: Payload,
        schedule: Schedule,
        priority: TaskPriority,
    ) -> Uuid {
        self.add_schedule(RecurringTask::new(kind, payload, schedule, priority))
            .await
    }

    /// Run `kind` on a cron expression (seconds field included, UTC).
    pub async fn schedule_cron(
        &self,
        kind: impl Into<String>,
        payload: Payload,
        expression: &str,
        priority: TaskPriority,
    ) -> std::result::Result<Uuid, ScheduleError> {
        let spec = RecurringTask::new(kind, payload, Schedule::cron(expression)?, priority);
        Ok(self.add_schedule(spec).await)
    }

    async fn add_schedule(&self, spec: RecurringTask) -> Uuid {
        let id = spec.id;
        info!(
            schedule_id = %id,
            kind = %spec.kind,
            schedule = %spec.schedule.describe(),
            "Recurring task scheduled"
        );
        self.state.lock().await.recurring.push(spec);
        id
    }

    /// Remove a recurring spec.
    pub async fn unschedule(&self, id: Uuid) -> std::result::Result<(), ScheduleError> {
        let mut state = self.state.lock().await;
        let before = state.recurring.len();
        state.recurring.retain(|spec| spec.id != id);
        if state.recurring.len() == before {
            return Err(ScheduleError::NotFound { id });
        }
        info!(schedule_id = %id, "Recurring task removed");
        Ok(())
    }

    pub async fn schedules(&self) -> Vec<RecurringInfo> {
        self.state
            .lock()
            .await
            .recurring
            .iter()
            .map(RecurringTask::info)
            .collect()
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Scheduler tick loop started");

        while self.is_running() {
            let tick = tokio::select! {
                _ = self.shutdown.notified() => break,
                tick = ticker.tick() => tick,
            };
            self.run_due(tick).await;
        }
        debug!("Scheduler tick loop exited");
    }

    /// Materialize every spec due at `tick`.
    async fn run_due(self: &Arc<Self>, tick: Instant) {
        let now = Utc::now();
        let due: Vec<(Uuid, Task)> = {
            let mut state = self.state.lock().await;
            state
                .recurring
                .iter_mut()
                .filter(|spec| spec.is_due(tick, now))
                .map(|spec| {
                    spec.mark_run(tick, now);
                    (spec.id, spec.materialize())
                })
                .collect()
        };

        for (schedule_id, task) in due {
            // One dispatch per spec; a slow inline service must not hold up the rest.
            let this = Arc::clone(self);
            tokio::spawn(async move {
                match this.submit_task(task).await {
                    Ok(task_id) => {
                        debug!(schedule_id = %schedule_id, task_id = %task_id, "Recurring task submitted")
                    }
                    Err(e) => warn!(schedule_id = %schedule_id, "Recurring task dispatch failed: {}", e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::HandlerError;
    use crate::worker::handler_fn;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            result_poll_interval: Duration::from_millis(20),
            dequeue_timeout: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn echo_handlers() -> HandlerRegistry {
        HandlerRegistry::new().with(
            "echo",
            handler_fn(|task: Task| async move { Ok(task.payload) }),
        )
    }

    struct CountingService {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl SyncService for CountingService {
        fn name(&self) -> &str {
            "counting"
        }

        async fn process(&self, payload: Payload) -> std::result::Result<Payload, HandlerError> {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn submit_and_wait_completes() {
        let coordinator = Coordinator::builder(fast_config())
            .worker("general", "general", echo_handlers())
            .build();
        coordinator.start();

        let request = TaskRequest::new("echo").with_payload(payload(json!({"msg": "hi"})));
        let (task_id, outcome) = coordinator
            .submit_and_wait(request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WaitOutcome::Completed {
                result: payload(json!({"msg": "hi"}))
            }
        );
        let entry = coordinator.task(task_id).await.unwrap();
        assert_eq!(entry.destination.as_deref(), Some("general"));
        assert!(entry.task.started_at.is_some());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn targeted_task_goes_to_named_worker() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = |name: &'static str| {
            let seen = seen.clone();
            HandlerRegistry::new().with(
                "echo",
                handler_fn(move |_task: Task| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(name);
                        Ok(Payload::new())
                    }
                }),
            )
        };
        let coordinator = Coordinator::builder(fast_config())
            .worker("first", "general", recorder("first"))
            .worker("second", "general", recorder("second"))
            .build();
        coordinator.start();

        for _ in 0..5 {
            let (_, outcome) = coordinator
                .submit_and_wait(
                    TaskRequest::new("echo").with_target("second"),
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            assert!(matches!(outcome, WaitOutcome::Completed { .. }));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["second"; 5]);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn inline_service_finishes_before_submit_returns() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coordinator = Coordinator::builder(fast_config())
            .worker("general", "general", echo_handlers())
            .service(
                ["price"],
                Arc::new(CountingService {
                    calls: calls.clone(),
                    delay: Duration::from_millis(100),
                }),
            )
            .build();
        // Not started: nothing could drain a queued task.

        let task_id = coordinator
            .submit(TaskRequest::new("price").with_payload(payload(json!({"symbol": "ETH"}))))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let entry = coordinator.task(task_id).await.unwrap();
        assert_eq!(entry.status, TaskStatus::Completed);
        assert_eq!(entry.destination.as_deref(), Some("counting"));
        assert_eq!(entry.result.unwrap()["symbol"], json!("ETH"));
        assert_eq!(coordinator.worker("general").unwrap().queue_len(), 0);
    }

    #[tokio::test]
    async fn unroutable_task_fails_in_ledger() {
        let coordinator = Coordinator::builder(fast_config())
            .worker("general", "general", echo_handlers())
            .build();

        let err = coordinator
            .submit(TaskRequest::new("launch_rocket"))
            .await
            .unwrap_err();
        let Error::Undeliverable { task_id, reason } = err else {
            panic!("expected Undeliverable, got {err:?}");
        };
        assert!(reason.contains("launch_rocket"));

        let entry = coordinator.task(task_id).await.unwrap();
        assert_eq!(entry.status, TaskStatus::Failed);
        assert!(entry.task.started_at.is_none());
        assert_eq!(coordinator.worker("general").unwrap().queue_len(), 0);
    }

    #[tokio::test]
    async fn target_refusing_kind_fails_in_ledger() {
        let coordinator = Coordinator::builder(fast_config())
            .worker("general", "general", echo_handlers())
            .worker("other", "general", HandlerRegistry::new())
            .build();

        let err = coordinator
            .submit(TaskRequest::new("echo").with_target("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Undeliverable { .. }));
        assert_eq!(coordinator.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn priority_order_while_paused() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handlers = {
            let seen = seen.clone();
            HandlerRegistry::new().with(
                "record",
                handler_fn(move |task: Task| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(task.payload["name"].as_str().unwrap_or_default().to_string());
                        Ok(Payload::new())
                    }
                }),
            )
        };
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", handlers)
            .build();

        let mut ids = Vec::new();
        for (name, priority) in [
            ("A", TaskPriority::Low),
            ("B", TaskPriority::High),
            ("C", TaskPriority::Medium),
        ] {
            let request = TaskRequest::new("record")
                .with_payload(payload(json!({ "name": name })))
                .with_priority(priority);
            ids.push(coordinator.submit(request).await.unwrap());
        }

        coordinator.start();
        for id in ids {
            let outcome = coordinator.wait_for_result(id, Duration::from_secs(5)).await;
            assert!(matches!(outcome, WaitOutcome::Completed { .. }));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["B", "C", "A"]);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn failing_task_does_not_block_next() {
        let handlers = echo_handlers().with(
            "explode",
            handler_fn(|_task: Task| async move {
                Err::<Payload, _>(HandlerError::failed("explode", "bad input"))
            }),
        );
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", handlers)
            .build();
        coordinator.start();

        let x = coordinator.submit(TaskRequest::new("explode")).await.unwrap();
        let y = coordinator.submit(TaskRequest::new("echo")).await.unwrap();

        let x_outcome = coordinator.wait_for_result(x, Duration::from_secs(5)).await;
        let WaitOutcome::Failed { error } = x_outcome else {
            panic!("expected failure, got {x_outcome:?}");
        };
        assert!(error.contains("bad input"));
        assert!(matches!(
            coordinator.wait_for_result(y, Duration::from_secs(5)).await,
            WaitOutcome::Completed { .. }
        ));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn wait_timeout_leaves_task_running() {
        let handlers = HandlerRegistry::new().with(
            "slow",
            handler_fn(|_task: Task| async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                Ok(Payload::new())
            }),
        );
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", handlers)
            .build();
        coordinator.start();

        let id = coordinator.submit(TaskRequest::new("slow")).await.unwrap();
        let outcome = coordinator
            .wait_for_result(id, Duration::from_millis(300))
            .await;
        assert_eq!(outcome, WaitOutcome::Timeout);

        // Timeout is never written back.
        let entry = coordinator.task(id).await.unwrap();
        assert!(!entry.status.is_terminal());

        assert!(matches!(
            coordinator.wait_for_result(id, Duration::from_secs(5)).await,
            WaitOutcome::Completed { .. }
        ));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn evicted_task_reports_unknown() {
        let coordinator = Coordinator::builder(CoordinatorConfig {
            max_tasks: 1,
            ..fast_config()
        })
        .worker("w", "general", echo_handlers())
        .build();

        let first = coordinator.submit(TaskRequest::new("echo")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = coordinator.submit(TaskRequest::new("echo")).await.unwrap();
        let report = coordinator.cleanup(true).await;

        assert_eq!(report.evicted, vec![first]);
        assert_eq!(
            coordinator.wait_for_result(first, Duration::from_secs(1)).await,
            WaitOutcome::Unknown
        );
        assert!(coordinator.task(second).await.is_some());
    }

    #[tokio::test]
    async fn cleanup_waits_for_submission_interval() {
        let coordinator = Coordinator::builder(CoordinatorConfig {
            max_tasks: 1,
            cleanup_interval: 3,
            ..fast_config()
        })
        .worker("w", "general", echo_handlers())
        .build();

        for _ in 0..3 {
            coordinator.submit(TaskRequest::new("echo")).await.unwrap();
        }
        assert_eq!(coordinator.stats().await.total, 3);
        assert_eq!(coordinator.cleanup(false).await.evicted.len(), 2);

        coordinator.submit(TaskRequest::new("echo")).await.unwrap();
        assert_eq!(coordinator.cleanup(false).await.removed(), 0);
        assert_eq!(coordinator.stats().await.total, 2);
    }

    #[tokio::test]
    async fn recurring_ping_fires_each_second() {
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", HandlerRegistry::new())
            .build();
        coordinator.start();

        let schedule_id = coordinator
            .schedule_recurring("ping", Payload::new(), Duration::from_secs(1), TaskPriority::Low)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let info = coordinator.schedules().await;
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].id, schedule_id);
        assert!(
            (3..=4).contains(&info[0].run_count),
            "expected 3..=4 runs, got {}",
            info[0].run_count
        );

        let stats = coordinator.stats().await;
        assert_eq!(stats.total as u64, info[0].run_count);
        assert_eq!(stats.completed, stats.total);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn slow_schedule_does_not_block_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", HandlerRegistry::new())
            .service(
                ["slow_inline"],
                Arc::new(CountingService {
                    calls: calls.clone(),
                    delay: Duration::from_secs(10),
                }),
            )
            .build();
        coordinator.start();

        coordinator
            .schedule_recurring("slow_inline", Payload::new(), Duration::from_secs(1), TaskPriority::Low)
            .await
            .unwrap();
        let fast = coordinator
            .schedule_recurring("ping", Payload::new(), Duration::from_secs(1), TaskPriority::Low)
            .await
            .unwrap();
        coordinator
            .schedule_recurring("no_such_kind", Payload::new(), Duration::from_secs(1), TaskPriority::Low)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let runs = coordinator
            .schedules()
            .await
            .into_iter()
            .find(|s| s.id == fast)
            .map(|s| s.run_count)
            .unwrap();
        assert!(runs >= 2, "ping schedule stalled at {runs} runs");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(coordinator.stats().await.completed >= 2);
    }

    #[tokio::test]
    async fn unschedule_removes_spec() {
        let coordinator = Coordinator::builder(fast_config()).build();
        let id = coordinator
            .schedule_cron("ping", Payload::new(), "0 0 * * * *", TaskPriority::Low)
            .await
            .unwrap();
        assert_eq!(coordinator.schedules().await.len(), 1);

        coordinator.unschedule(id).await.unwrap();
        assert!(coordinator.schedules().await.is_empty());
        assert!(matches!(
            coordinator.unschedule(id).await,
            Err(ScheduleError::NotFound { .. })
        ));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_records_in_flight_outcome() {
        let handlers = HandlerRegistry::new().with(
            "slow",
            handler_fn(|_task: Task| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Payload::new())
            }),
        );
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", handlers)
            .build();
        coordinator.start();

        let id = coordinator.submit(TaskRequest::new("slow")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.shutdown().await;

        let entry = coordinator.task(id).await.unwrap();
        assert_eq!(entry.status, TaskStatus::Completed);
        assert!(entry.completed_at.is_some());
    }

    #[tokio::test]
    async fn restart_after_shutdown_drains_again() {
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", echo_handlers())
            .build();
        coordinator.start();
        coordinator.shutdown().await;
        coordinator.start();

        let (_, outcome) = coordinator
            .submit_and_wait(TaskRequest::new("echo"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Completed { .. }));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn events_follow_lifecycle() {
        let coordinator = Coordinator::builder(fast_config())
            .worker("w", "general", echo_handlers())
            .build();
        let mut events = coordinator.subscribe();
        coordinator.start();

        let id = coordinator.submit(TaskRequest::new("echo")).await.unwrap();
        let mut seen = Vec::new();
        while seen.len() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.task_id(), id);
            seen.push(event);
        }
        assert!(matches!(seen[0], TaskEvent::Submitted { .. }));
        assert!(matches!(seen[1], TaskEvent::Processing { ref destination, .. } if destination == "w"));
        assert!(matches!(seen[2], TaskEvent::Completed { .. }));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_submit_cleanup_and_drain() {
        let coordinator = Coordinator::builder(CoordinatorConfig {
            max_tasks: 50,
            cleanup_interval: 10,
            drain_cleanup_every: 5,
            ..fast_config()
        })
        .worker("a", "general", echo_handlers())
        .worker("b", "general", echo_handlers())
        .build();
        coordinator.start();

        let mut handles = Vec::new();
        for i in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..25 {
                    let target = if (i + j) % 2 == 0 { "a" } else { "b" };
                    coordinator
                        .submit(TaskRequest::new("echo").with_target(target))
                        .await
                        .unwrap();
                    if j % 7 == 0 {
                        coordinator.cleanup(true).await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        coordinator.cleanup(true).await;
        let stats = coordinator.stats().await;
        assert!(stats.total <= 50);
        assert_eq!(
            stats.total,
            stats.pending + stats.processing + stats.completed + stats.failed
        );
        coordinator.shutdown().await;
    }
}
