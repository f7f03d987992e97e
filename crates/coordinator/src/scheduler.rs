//! Task scheduler.
//!
//! One actor task owns the pending queue, the task table and the
//! assignment table; [`Scheduler`] is a cloneable handle that talks to it
//! over a command channel. Each dispatched task runs its RPC in a spawned
//! task that reports back as a message, so the actor never waits on a
//! worker.
//!
//! The actor re-runs dispatch after every command, every execution report,
//! every pool availability signal and every deadline tick.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lingosub_core::capability::{validate_engine_set, EngineCapability};
use lingosub_core::error::{ErrorCode, FailureCause};
use lingosub_core::scheduling::{state_machine, Priority, TaskStatus};
use lingosub_core::types::{TaskId, TaskIdAllocator, Timestamp, WorkerId};
use lingosub_events::{CoordinatorEvent, EventBus};
use lingosub_sidecar::messages::{TranscribeParams, METHOD_TRANSCRIBE};
use lingosub_sidecar::{CancelHandle, ExecutionOutcome};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{EngineResult, ResultAggregator};
use crate::pool::{WorkerHandle, WorkerPool};
use crate::queue::TaskQueue;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_AGING_THRESHOLD: Duration = Duration::from_secs(60);
pub const DEFAULT_CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RETAINED_TASKS: usize = 10_000;

/// Engine error code a worker uses when it has no free slot.
const ENGINE_BUSY: &str = "NO_CAPACITY";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound for one `transcribe` request.
    pub rpc_timeout: Duration,
    /// Default overall deadline of a task, spanning all of its attempts.
    pub task_timeout: Duration,
    /// A task fails once this many attempts were lost to retryable errors.
    pub max_retries: u32,
    /// Waiting this long promotes a queued task by one priority level.
    pub aging_threshold: Duration,
    pub cancel_ack_timeout: Duration,
    /// Terminal tasks kept for `status`/`wait`/`list`; the oldest are
    /// forgotten beyond this.
    pub retained_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            aging_threshold: DEFAULT_AGING_THRESHOLD,
            cancel_ack_timeout: DEFAULT_CANCEL_ACK_TIMEOUT,
            retained_tasks: DEFAULT_RETAINED_TASKS,
        }
    }
}

/// A unit of work to schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// Any of these engines may run the task.
    pub engines: Vec<EngineCapability>,
    pub priority: Priority,
    /// Passed to the engine untouched.
    pub payload: Value,
    /// Overrides [`SchedulerConfig::task_timeout`].
    pub timeout: Option<Duration>,
    /// Comparison this task contributes a result to.
    pub group: Option<TaskId>,
}

impl TaskRequest {
    pub fn new(engines: impl Into<Vec<EngineCapability>>, payload: Value) -> Self {
        Self {
            engines: engines.into(),
            priority: Priority::default(),
            payload,
            timeout: None,
            group: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_group(mut self, group: TaskId) -> Self {
        self.group = Some(group);
        self
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub status: TaskStatus,
    pub priority: Priority,
    pub engines: Vec<EngineCapability>,
    pub group: Option<TaskId>,
    /// Attempts lost to retryable failures.
    pub retries: u32,
    /// Times the task was dispatched.
    pub attempts: u32,
    /// Worker of the current or last assignment.
    pub worker_id: Option<WorkerId>,
    pub engine: Option<EngineCapability>,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub result: Option<Value>,
    pub cause: Option<FailureCause>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("invalid task: {0}")]
    InvalidParams(String),

    #[error("no configured worker provides any of {engines:?}")]
    NoWorker { engines: Vec<EngineCapability> },

    #[error("scheduler is shut down")]
    ShuttingDown,
}

impl SchedulerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SchedulerError::TaskNotFound(_) => ErrorCode::TaskNotFound,
            SchedulerError::InvalidParams(_) => ErrorCode::InvalidParams,
            SchedulerError::NoWorker { .. } | SchedulerError::ShuttingDown => ErrorCode::NoCapacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the scheduler actor.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    ids: Arc<TaskIdAllocator>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Spawn the actor. It runs until [`shutdown`](Self::shutdown) is
    /// called or every handle is dropped.
    pub fn spawn(
        config: SchedulerConfig,
        pool: Arc<WorkerPool>,
        aggregator: Arc<ResultAggregator>,
        events: Arc<EventBus>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let actor = SchedulerActor {
            queue: TaskQueue::new(config.aging_threshold),
            config,
            pool,
            aggregator,
            events,
            tasks: HashMap::new(),
            assignments: HashMap::new(),
            deadlines: BTreeSet::new(),
            waiters: HashMap::new(),
            finished: VecDeque::new(),
            reports,
            next_seq: 0,
        };
        let task = tokio::spawn(actor.run(commands_rx, reports_rx, cancel.clone()));

        let handle = Self {
            commands,
            ids: Arc::new(TaskIdAllocator::new()),
            cancel,
        };
        (handle, task)
    }

    /// Allocate a task id without submitting anything, e.g. for a
    /// comparison group.
    pub fn allocate_id(&self) -> TaskId {
        self.ids.allocate()
    }

    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, SchedulerError> {
        let id = self.ids.allocate();
        self.request(|reply| Command::Submit { id, request, reply })
            .await??;
        Ok(id)
    }

    /// Cancel a task. Returns `false` if it was already terminal or being
    /// cancelled.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, SchedulerError> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.request(|reply| Command::Status { id, reply }).await?
    }

    /// Resolve once the task reaches a terminal status.
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.request(|reply| Command::Wait { id, reply }).await?
    }

    /// Every known task, ordered by id.
    pub async fn list(&self) -> Result<Vec<TaskSnapshot>, SchedulerError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Stop the actor. Open tasks are cancelled and their waiters resolved.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

enum Command {
    Submit {
        id: TaskId,
        request: TaskRequest,
        reply: Reply<()>,
    },
    Cancel {
        id: TaskId,
        reply: Reply<bool>,
    },
    Status {
        id: TaskId,
        reply: Reply<TaskSnapshot>,
    },
    Wait {
        id: TaskId,
        reply: Reply<TaskSnapshot>,
    },
    List {
        reply: oneshot::Sender<Vec<TaskSnapshot>>,
    },
}

/// Messages from spawned execution and cancel tasks.
enum Report {
    Finished {
        task_id: TaskId,
        attempt: u32,
        outcome: ExecutionOutcome,
    },
    CancelSettled {
        task_id: TaskId,
        attempt: u32,
        acknowledged: bool,
    },
}

struct TaskRecord {
    id: TaskId,
    engines: Vec<EngineCapability>,
    priority: Priority,
    payload: Value,
    group: Option<TaskId>,
    seq: u64,
    deadline: Instant,
    status: TaskStatus,
    retries: u32,
    attempts: u32,
    worker_id: Option<WorkerId>,
    engine: Option<EngineCapability>,
    submitted_at: Timestamp,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    result: Option<Value>,
    cause: Option<FailureCause>,
}

impl TaskRecord {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            status: self.status,
            priority: self.priority,
            engines: self.engines.clone(),
            group: self.group,
            retries: self.retries,
            attempts: self.attempts,
            worker_id: self.worker_id,
            engine: self.engine,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            cause: self.cause.clone(),
        }
    }

    /// Apply a validated status change.
    fn transition(&mut self, to: TaskStatus) -> bool {
        match state_machine::validate_transition(self.status, to) {
            Ok(()) => {
                self.status = to;
                true
            }
            Err(reason) => {
                tracing::warn!(task_id = %self.id, reason = %reason, "Rejected task transition");
                false
            }
        }
    }
}

/// One task executing on one worker slot.
struct Assignment {
    attempt: u32,
    cancel: CancelHandle,
    execution: JoinHandle<()>,
}

struct SchedulerActor {
    config: SchedulerConfig,
    pool: Arc<WorkerPool>,
    aggregator: Arc<ResultAggregator>,
    events: Arc<EventBus>,
    tasks: HashMap<TaskId, TaskRecord>,
    queue: TaskQueue,
    assignments: HashMap<TaskId, Assignment>,
    /// Deadlines of every non-terminal task.
    deadlines: BTreeSet<(Instant, TaskId)>,
    waiters: HashMap<TaskId, Vec<Reply<TaskSnapshot>>>,
    /// Terminal tasks, oldest first.
    finished: VecDeque<TaskId>,
    reports: mpsc::UnboundedSender<Report>,
    next_seq: u64,
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SchedulerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Report>,
        cancel: CancellationToken,
    ) {
        let availability = self.pool.availability();
        tracing::info!(
            rpc_timeout_ms = self.config.rpc_timeout.as_millis() as u64,
            task_timeout_ms = self.config.task_timeout.as_millis() as u64,
            aging_threshold_ms = self.config.aging_threshold.as_millis() as u64,
            max_retries = self.config.max_retries,
            retained_tasks = self.config.retained_tasks,
            "Task scheduler started",
        );

        loop {
            let next_deadline = self.deadlines.first().map(|(at, _)| *at);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Task scheduler shutting down");
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(report) = reports.recv() => self.handle_report(report),
                _ = availability.notified() => {}
                _ = sleep_until(next_deadline) => self.expire(Instant::now()),
            }
            self.dispatch();
        }

        self.abandon_all();
    }

    // -- commands -----------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { id, request, reply } => {
                let _ = reply.send(self.submit(id, request));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Status { id, reply } => {
                let snapshot = self
                    .tasks
                    .get(&id)
                    .map(TaskRecord::snapshot)
                    .ok_or(SchedulerError::TaskNotFound(id));
                let _ = reply.send(snapshot);
            }
            Command::Wait { id, reply } => match self.tasks.get(&id) {
                None => {
                    let _ = reply.send(Err(SchedulerError::TaskNotFound(id)));
                }
                Some(task) if task.status.is_terminal() => {
                    let _ = reply.send(Ok(task.snapshot()));
                }
                Some(_) => self.waiters.entry(id).or_default().push(reply),
            },
            Command::List { reply } => {
                let mut all: Vec<TaskSnapshot> =
                    self.tasks.values().map(TaskRecord::snapshot).collect();
                all.sort_by_key(|t| t.id);
                let _ = reply.send(all);
            }
        }
    }

    fn submit(&mut self, id: TaskId, request: TaskRequest) -> Result<(), SchedulerError> {
        validate_engine_set(&request.engines)
            .map_err(|e| SchedulerError::InvalidParams(e.to_string()))?;
        if !self.pool.serves_any(&request.engines) {
            return Err(SchedulerError::NoWorker {
                engines: request.engines,
            });
        }

        let now = Instant::now();
        let deadline = now + request.timeout.unwrap_or(self.config.task_timeout);
        self.next_seq += 1;
        let seq = self.next_seq;

        self.queue.push(id, request.priority, seq, now);
        tracing::info!(
            task_id = %id,
            priority = %request.priority,
            engines = ?request.engines,
            group = ?request.group,
            queued = self.queue.len(),
            "Task submitted",
        );

        self.deadlines.insert((deadline, id));
        self.tasks.insert(
            id,
            TaskRecord {
                id,
                engines: request.engines,
                priority: request.priority,
                payload: request.payload,
                group: request.group,
                seq,
                deadline,
                status: TaskStatus::Pending,
                retries: 0,
                attempts: 0,
                worker_id: None,
                engine: None,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
                result: None,
                cause: None,
            },
        );
        self.publish_status(id, None);
        Ok(())
    }

    fn cancel(&mut self, id: TaskId) -> Result<bool, SchedulerError> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound(id))?;

        match task.status {
            TaskStatus::Pending => {
                self.finish(id, TaskStatus::Cancelled, None, Some(cancelled_cause()));
                Ok(true)
            }
            TaskStatus::Running => {
                task.transition(TaskStatus::Cancelling);
                tracing::info!(task_id = %id, "Cancelling running task");
                self.publish_status(id, None);
                self.request_cancel(id, true);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // -- dispatch -----------------------------------------------------------

    fn dispatch(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let now = Instant::now();
        for id in self.queue.ordered(now) {
            let Some(task) = self.tasks.get(&id) else {
                self.queue.remove(id);
                continue;
            };
            // Expired tasks are failed by the deadline tick instead.
            if task.deadline <= now {
                continue;
            }
            // Tasks with no idle eligible worker stay queued.
            if let Ok(handle) = self.pool.acquire(&task.engines) {
                self.start(id, handle, now);
            }
        }
    }

    fn start(&mut self, id: TaskId, handle: WorkerHandle, now: Instant) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if !task.transition(TaskStatus::Running) {
            return;
        }
        let effective = self.queue.priority_of(id, now).unwrap_or(task.priority);
        self.queue.remove(id);

        task.attempts += 1;
        task.worker_id = Some(handle.worker_id());
        task.engine = Some(handle.engine());
        task.started_at = Some(Utc::now());
        let attempt = task.attempts;
        let timeout = self
            .config
            .rpc_timeout
            .min(task.deadline.saturating_duration_since(now));

        let params = match serde_json::to_value(TranscribeParams {
            task_id: id,
            payload: task.payload.clone(),
        }) {
            Ok(params) => params,
            Err(e) => {
                drop(handle);
                let cause = FailureCause::new(ErrorCode::InvalidParams, e.to_string());
                self.finish(id, TaskStatus::Failed, None, Some(cause));
                return;
            }
        };

        tracing::info!(
            task_id = %id,
            worker = handle.supervisor(),
            worker_id = %handle.worker_id(),
            engine = %handle.engine(),
            priority = %effective,
            attempt,
            timeout_ms = timeout.as_millis() as u64,
            "Task dispatched",
        );

        let cancel = handle.cancel_handle();
        let reports = self.reports.clone();
        let execution = tokio::spawn(async move {
            let outcome = handle.execute(METHOD_TRANSCRIBE, params, timeout).await;
            // Free the slot before the actor sees the result so it can
            // be reused by the next dispatch.
            drop(handle);
            let _ = reports.send(Report::Finished {
                task_id: id,
                attempt,
                outcome,
            });
        });

        self.assignments.insert(
            id,
            Assignment {
                attempt,
                cancel,
                execution,
            },
        );
        self.publish_status(id, None);
    }

    // -- reports ------------------------------------------------------------

    fn is_current(&self, task_id: TaskId, attempt: u32) -> bool {
        self.assignments
            .get(&task_id)
            .is_some_and(|a| a.attempt == attempt)
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Finished {
                task_id,
                attempt,
                outcome,
            } => {
                if !self.is_current(task_id, attempt) {
                    tracing::debug!(task_id = %task_id, attempt, "Discarding result of a superseded attempt");
                    return;
                }
                self.assignments.remove(&task_id);
                let Some(status) = self.tasks.get(&task_id).map(|t| t.status) else {
                    return;
                };

                match (status, outcome) {
                    (TaskStatus::Cancelling, _) => {
                        self.finish(task_id, TaskStatus::Cancelled, None, Some(cancelled_cause()));
                    }
                    (TaskStatus::Running, ExecutionOutcome::Completed(value)) => {
                        self.finish(task_id, TaskStatus::Completed, Some(value), None);
                    }
                    (TaskStatus::Running, ExecutionOutcome::Failed { code, message })
                        if code == ENGINE_BUSY =>
                    {
                        self.retry_or_fail(task_id, ErrorCode::NoCapacity, message);
                    }
                    (TaskStatus::Running, ExecutionOutcome::Failed { code, message }) => {
                        let cause =
                            FailureCause::new(ErrorCode::TaskFailed, format!("{code}: {message}"));
                        self.finish(task_id, TaskStatus::Failed, None, Some(cause));
                    }
                    (TaskStatus::Running, ExecutionOutcome::TimedOut { after }) => {
                        let message = format!("no response within {}ms", after.as_millis());
                        self.retry_or_fail(task_id, ErrorCode::RpcTimeout, message);
                    }
                    (TaskStatus::Running, ExecutionOutcome::WorkerLost { reason }) => {
                        self.retry_or_fail(task_id, ErrorCode::WorkerLost, reason);
                    }
                    _ => {}
                }
            }
            Report::CancelSettled {
                task_id,
                attempt,
                acknowledged,
            } => {
                let cancelling = self
                    .tasks
                    .get(&task_id)
                    .is_some_and(|t| t.status == TaskStatus::Cancelling);
                if !cancelling || !self.is_current(task_id, attempt) {
                    return;
                }
                if acknowledged {
                    tracing::debug!(task_id = %task_id, "Worker acknowledged cancellation");
                } else {
                    tracing::warn!(task_id = %task_id, "Cancellation not acknowledged in time");
                }
                self.finish(task_id, TaskStatus::Cancelled, None, Some(cancelled_cause()));
            }
        }
    }

    fn retry_or_fail(&mut self, id: TaskId, code: ErrorCode, message: String) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.deadline <= Instant::now() {
            self.finish(id, TaskStatus::Failed, None, Some(timeout_cause()));
            return;
        }
        task.retries += 1;
        if task.retries >= self.config.max_retries {
            let cause = FailureCause::retries_exhausted(code, message);
            self.finish(id, TaskStatus::Failed, None, Some(cause));
            return;
        }
        if !task.transition(TaskStatus::Pending) {
            return;
        }

        tracing::warn!(
            task_id = %id,
            code = %code,
            retries = task.retries,
            max_retries = self.config.max_retries,
            reason = %message,
            "Task requeued",
        );
        task.worker_id = None;
        task.engine = None;
        // Original priority and sequence; the aging clock restarts.
        self.queue.push(id, task.priority, task.seq, Instant::now());
        self.publish_status(id, Some(FailureCause::new(code, message)));
    }

    // -- deadlines ----------------------------------------------------------

    fn expire(&mut self, now: Instant) {
        let due: Vec<(Instant, TaskId)> = self
            .deadlines
            .iter()
            .take_while(|(at, _)| *at <= now)
            .copied()
            .collect();

        for entry in due {
            self.deadlines.remove(&entry);
            let id = entry.1;
            let Some(status) = self.tasks.get(&id).map(|t| t.status) else {
                continue;
            };
            match status {
                TaskStatus::Pending => {
                    tracing::warn!(task_id = %id, "Task deadline elapsed while queued");
                    self.finish(id, TaskStatus::Failed, None, Some(timeout_cause()));
                }
                TaskStatus::Running => {
                    tracing::warn!(task_id = %id, "Task deadline elapsed while running");
                    self.request_cancel(id, false);
                    self.finish(id, TaskStatus::Failed, None, Some(timeout_cause()));
                }
                TaskStatus::Cancelling => {
                    self.finish(id, TaskStatus::Cancelled, None, Some(cancelled_cause()));
                }
                _ => {}
            }
        }
    }

    // -- completion ---------------------------------------------------------

    /// Send a best-effort `cancel` to the worker running `id`. With
    /// `settle`, the outcome is reported back so a `Cancelling` task can
    /// complete.
    fn request_cancel(&self, id: TaskId, settle: bool) {
        let Some(assignment) = self.assignments.get(&id) else {
            return;
        };
        let handle = assignment.cancel.clone();
        let attempt = assignment.attempt;
        let timeout = self.config.cancel_ack_timeout;
        let reports = settle.then(|| self.reports.clone());

        tokio::spawn(async move {
            let acknowledged = match handle.cancel(id, timeout).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(task_id = %id, worker_id = %handle.worker_id(), error = %e, "Cancel request failed");
                    false
                }
            };
            if let Some(reports) = reports {
                let _ = reports.send(Report::CancelSettled {
                    task_id: id,
                    attempt,
                    acknowledged,
                });
            }
        });
    }

    fn finish(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        cause: Option<FailureCause>,
    ) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if !task.transition(status) {
            return;
        }
        task.finished_at = Some(Utc::now());
        task.result = result;
        task.cause = cause;
        task.payload = Value::Null;
        let snapshot = task.snapshot();

        self.deadlines.remove(&(task.deadline, id));
        self.queue.remove(id);
        // A late result from this assignment is discarded.
        self.assignments.remove(&id);

        match &snapshot.cause {
            Some(cause) => tracing::warn!(task_id = %id, status = %status, cause = %cause, "Task finished"),
            None => tracing::info!(task_id = %id, status = %status, "Task finished"),
        }
        self.events.publish(CoordinatorEvent::TaskStatusChanged {
            task_id: id,
            status,
            worker_id: snapshot.worker_id,
            cause: snapshot.cause.clone(),
        });
        self.report_to_aggregator(&snapshot);

        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.send(Ok(snapshot.clone()));
        }

        self.finished.push_back(id);
        self.evict_finished();
    }

    /// Forget the oldest terminal tasks beyond the retention limit.
    fn evict_finished(&mut self) {
        while self.finished.len() > self.config.retained_tasks {
            let Some(id) = self.finished.pop_front() else {
                break;
            };
            self.tasks.remove(&id);
            tracing::debug!(task_id = %id, "Terminal task evicted");
        }
    }

    fn report_to_aggregator(&self, snapshot: &TaskSnapshot) {
        // Credit the engine that ran the task; one that never ran is
        // charged to its first accepted engine.
        let engine = snapshot.engine.or_else(|| snapshot.engines.first().copied());
        let (Some(group), Some(engine)) = (snapshot.group, engine) else {
            return;
        };
        let parsed = match (snapshot.status, snapshot.result.clone()) {
            (TaskStatus::Completed, Some(value)) => EngineResult::from_value(value),
            _ => None,
        };
        let recorded = match parsed {
            Some(result) => self.aggregator.record(group, engine, result),
            None => self.aggregator.record_failure(group, engine),
        };
        if let Err(e) = recorded {
            tracing::warn!(task_id = %snapshot.id, group = %group, error = %e, "Could not record comparison result");
        }
    }

    fn publish_status(&self, id: TaskId, cause: Option<FailureCause>) {
        if let Some(task) = self.tasks.get(&id) {
            self.events.publish(CoordinatorEvent::TaskStatusChanged {
                task_id: id,
                status: task.status,
                worker_id: task.worker_id,
                cause,
            });
        }
    }

    /// Cancel every open task on shutdown.
    fn abandon_all(&mut self) {
        for assignment in self.assignments.values() {
            assignment.execution.abort();
        }

        let open: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        if !open.is_empty() {
            tracing::info!(tasks = open.len(), "Cancelling open tasks");
        }

        for id in open {
            if let Some(task) = self.tasks.get_mut(&id) {
                if task.status == TaskStatus::Running {
                    task.transition(TaskStatus::Cancelling);
                }
            }
            let cause = FailureCause::new(ErrorCode::TaskCancelled, "coordinator shutting down");
            self.finish(id, TaskStatus::Cancelled, None, Some(cause));
        }
    }
}

fn cancelled_cause() -> FailureCause {
    FailureCause::new(ErrorCode::TaskCancelled, "cancelled by caller")
}

fn timeout_cause() -> FailureCause {
    FailureCause::new(ErrorCode::TaskTimeout, "task deadline elapsed")
}
