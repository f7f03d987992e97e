//! Lifecycle supervision of one worker process.
//!
//! A [`WorkerSupervisor`] owns at most one live process at a time. It
//! launches the process, performs the capability handshake, hands out
//! [`SlotLease`]s to the scheduler, records heartbeats and turns crashes
//! into [`HealthSignal`]s. Every relaunch gets a fresh [`WorkerId`].
//!
//! State lives behind a plain `std::sync::Mutex` that is never held across
//! an `.await`. Lifecycle operations that do await (`start`, `stop`,
//! `restart`) are serialized by a separate async mutex.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use lingosub_core::backoff::BackoffConfig;
use lingosub_core::capability::EngineCapability;
use lingosub_core::error::ErrorCode;
use lingosub_core::types::{TaskId, Timestamp, WorkerId};
use lingosub_core::worker_pool::{state_machine, WorkerCandidate, WorkerState};
use lingosub_events::{CoordinatorEvent, EventBus};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelConfig, ChannelError, ChannelEvent, CloseReason};
use crate::launcher::{ExitInfo, LaunchError, Launcher, ProcessHandle, WorkerCommand};
use crate::messages::{
    CancelParams, Capabilities, HealthReport, Heartbeat, ProgressParams, METHOD_CANCEL,
    METHOD_GET_CAPABILITIES, METHOD_GET_METRICS, METHOD_HEALTH_CHECK, NOTIFY_PROGRESS,
    NOTIFY_SHUTDOWN,
};
use crate::restart::{self, RestartOutcome};

/// Default time allowed for the `get_capabilities` handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for a killed process to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration and public types
// ---------------------------------------------------------------------------

/// Static configuration of one supervised worker.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Unique name, e.g. `whisper-0`.
    pub name: String,
    pub engine: EngineCapability,
    pub command: WorkerCommand,
    /// Maximum concurrent assignments. A worker may advertise fewer.
    pub slots: u32,
    pub channel: ChannelConfig,
    pub handshake_timeout: Duration,
    pub restart: BackoffConfig,
}

impl SupervisorConfig {
    pub fn new(name: impl Into<String>, engine: EngineCapability, command: WorkerCommand) -> Self {
        Self {
            name: name.into(),
            engine,
            command,
            slots: 1,
            channel: ChannelConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            restart: BackoffConfig::default(),
        }
    }
}

/// Failure notifications sent to the health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    /// Launch or handshake failed.
    StartFailed { supervisor: String, error: String },
    /// A running worker's process exited or its channel closed.
    Exited {
        supervisor: String,
        worker_id: WorkerId,
        reason: String,
    },
}

impl HealthSignal {
    pub fn supervisor(&self) -> &str {
        match self {
            HealthSignal::StartFailed { supervisor, .. } | HealthSignal::Exited { supervisor, .. } => {
                supervisor
            }
        }
    }
}

/// How one request on a leased slot ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Value),
    /// The engine reported an error for this request.
    Failed { code: String, message: String },
    /// No response within the RPC timeout.
    TimedOut { after: Duration },
    /// The channel closed or the worker broke protocol before responding.
    WorkerLost { reason: String },
}

impl ExecutionOutcome {
    /// Error code of a non-successful outcome.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ExecutionOutcome::Completed(_) => None,
            ExecutionOutcome::Failed { .. } => Some(ErrorCode::TaskFailed),
            ExecutionOutcome::TimedOut { .. } => Some(ErrorCode::RpcTimeout),
            ExecutionOutcome::WorkerLost { .. } => Some(ErrorCode::WorkerLost),
        }
    }
}

impl From<Result<Value, ChannelError>> for ExecutionOutcome {
    fn from(result: Result<Value, ChannelError>) -> Self {
        match result {
            Ok(value) => ExecutionOutcome::Completed(value),
            Err(ChannelError::Remote { code, message }) => ExecutionOutcome::Failed { code, message },
            Err(ChannelError::Timeout { timeout, .. }) => ExecutionOutcome::TimedOut { after: timeout },
            Err(e @ (ChannelError::Closed(_) | ChannelError::Protocol(_))) => {
                ExecutionOutcome::WorkerLost {
                    reason: e.to_string(),
                }
            }
            Err(e) => ExecutionOutcome::Failed {
                code: e.code().as_str().to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// Point-in-time view of a supervised worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub supervisor: String,
    pub engine: EngineCapability,
    pub state: WorkerState,
    pub worker_id: Option<WorkerId>,
    pub pid: Option<u32>,
    pub load: u32,
    pub slots: u32,
    /// Queue length the worker last reported in a heartbeat.
    pub queue_size: u32,
    pub started_at: Option<Timestamp>,
    /// Wall-clock time of the last heartbeat, for display.
    pub last_heartbeat: Option<Timestamp>,
    /// Monotonic time of the last sign of life; liveness is judged on this.
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// What the engine last answered to `get_metrics`.
    pub metrics: Option<Value>,
    pub restart_attempts: u32,
    pub restart_exhausted: bool,
    pub last_error: Option<String>,
}

impl WorkerStatus {
    /// The view the selection policy needs, keyed by `key`.
    pub fn candidate<K>(&self, key: K) -> WorkerCandidate<K> {
        WorkerCandidate {
            key,
            engine: self.engine,
            state: self.state,
            load: self.load,
            slots: self.slots,
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("capability handshake failed: {0}")]
    Handshake(String),

    #[error("worker '{name}' cannot start from state {state}")]
    InvalidState { name: String, state: WorkerState },

    #[error("worker '{0}' has been stopped")]
    Stopped(String),
}

impl SupervisorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::Launch(_) | SupervisorError::Handshake(_) => {
                ErrorCode::ProcessStartFailed
            }
            SupervisorError::InvalidState { .. } => ErrorCode::NoCapacity,
            SupervisorError::Stopped(_) => ErrorCode::WorkerLost,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct ProcessSlot {
    worker_id: WorkerId,
    pid: Option<u32>,
    channel: Arc<Channel>,
    slots: u32,
    load: u32,
    started_at: Timestamp,
    last_heartbeat: Timestamp,
    last_seen: Instant,
    metrics: Option<Value>,
    reported_queue: u32,
    /// Dropping this sender kills the process.
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

struct Inner {
    state: WorkerState,
    process: Option<ProcessSlot>,
    restart_attempts: u32,
    restart_exhausted: bool,
    last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkerSupervisor
// ---------------------------------------------------------------------------

/// Supervises one worker process through its whole lifecycle.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn Launcher>,
    events: Arc<EventBus>,
    health: mpsc::UnboundedSender<HealthSignal>,
    availability: Arc<Notify>,
    inner: Mutex<Inner>,
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl WorkerSupervisor {
    /// Create a supervisor in the `Created` state. Nothing is launched
    /// until [`start`](Self::start).
    ///
    /// `availability` is notified whenever a slot may have become free.
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn Launcher>,
        events: Arc<EventBus>,
        health: mpsc::UnboundedSender<HealthSignal>,
        availability: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            events,
            health,
            availability,
            inner: Mutex::new(Inner {
                state: WorkerState::Created,
                process: None,
                restart_attempts: 0,
                restart_exhausted: false,
                last_error: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn engine(&self) -> EngineCapability {
        self.config.engine
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a validated state transition and publish it.
    ///
    /// Returns `false` (and changes nothing) if the transition is invalid.
    fn set_state(&self, inner: &mut Inner, to: WorkerState) -> bool {
        let from = inner.state;
        if from == to {
            return true;
        }
        if !state_machine::can_transition(from, to) {
            tracing::warn!(
                worker = %self.config.name,
                from = %from,
                to = %to,
                "Rejected invalid worker state transition",
            );
            return false;
        }

        inner.state = to;
        let worker_id = inner.process.as_ref().map(|p| p.worker_id);
        tracing::debug!(worker = %self.config.name, from = %from, to = %to, "Worker state changed");
        self.events.publish(CoordinatorEvent::WorkerStateChanged {
            supervisor: self.config.name.clone(),
            engine: self.config.engine,
            worker_id,
            from,
            to,
        });

        if to == WorkerState::Idle {
            self.availability.notify_one();
        }
        true
    }

    // -- lifecycle ----------------------------------------------------------

    /// Launch the worker and wait for its capability handshake.
    ///
    /// Only valid from `Created`. On failure the worker is left `Unhealthy`
    /// and a [`HealthSignal::StartFailed`] is sent.
    pub async fn start(self: &Arc<Self>) -> Result<WorkerId, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Start with the lifecycle lock already held.
    pub(crate) async fn start_locked(self: &Arc<Self>) -> Result<WorkerId, SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::Stopped(self.config.name.clone()));
        }
        {
            let mut inner = self.lock();
            if !self.set_state(&mut inner, WorkerState::Starting) {
                return Err(SupervisorError::InvalidState {
                    name: self.config.name.clone(),
                    state: inner.state,
                });
            }
        }

        let launched = match self.launcher.launch(&self.config.command, &self.config.name).await {
            Ok(launched) => launched,
            Err(e) => {
                self.start_failed(e.to_string());
                return Err(e.into());
            }
        };

        let worker_id = WorkerId::new();
        let (channel, channel_events) = Channel::open(
            launched.output,
            launched.input,
            format!("{}/{}", self.config.name, worker_id),
            &self.config.channel,
        );
        let channel = Arc::new(channel);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let now = Utc::now();

        self.lock().process = Some(ProcessSlot {
            worker_id,
            pid: launched.pid,
            channel: Arc::clone(&channel),
            slots: self.config.slots.max(1),
            load: 0,
            started_at: now,
            last_heartbeat: now,
            last_seen: Instant::now(),
            metrics: None,
            reported_queue: 0,
            kill: Some(kill_tx),
            exited: exit_rx,
        });

        tokio::spawn(watch_process(
            Arc::downgrade(self),
            worker_id,
            launched.process,
            kill_rx,
            exit_tx,
            Arc::clone(&channel),
        ));
        tokio::spawn(pump_events(Arc::downgrade(self), worker_id, channel_events));

        let capabilities = match self.handshake(&channel).await {
            Ok(caps) => caps,
            Err(msg) => {
                self.start_failed(msg.clone());
                return Err(SupervisorError::Handshake(msg));
            }
        };

        let slots = {
            let mut inner = self.lock();
            // The process may have died between the response and now.
            if channel.is_closed() || inner.state != WorkerState::Starting {
                drop(inner);
                let msg = "worker exited during handshake".to_string();
                self.start_failed(msg.clone());
                return Err(SupervisorError::Handshake(msg));
            }
            let configured = self.config.slots.max(1);
            let slots = capabilities
                .slots
                .map_or(configured, |s| s.clamp(1, configured));
            if let Some(slot) = inner.process.as_mut() {
                slot.slots = slots;
            }
            inner.last_error = None;
            self.set_state(&mut inner, WorkerState::Idle);
            slots
        };

        tracing::info!(
            worker = %self.config.name,
            worker_id = %worker_id,
            engine = %self.config.engine,
            pid = ?launched.pid,
            slots,
            "Worker ready",
        );
        Ok(worker_id)
    }

    async fn handshake(&self, channel: &Channel) -> Result<Capabilities, String> {
        let value = channel
            .send(METHOD_GET_CAPABILITIES, json!({}), self.config.handshake_timeout)
            .await
            .map_err(|e| e.to_string())?;
        let caps: Capabilities =
            serde_json::from_value(value).map_err(|e| format!("invalid capabilities: {e}"))?;
        if !caps.supports(self.config.engine) {
            return Err(format!(
                "worker does not offer engine '{}' (offers {:?})",
                self.config.engine, caps.engines
            ));
        }
        Ok(caps)
    }

    fn start_failed(&self, error: String) {
        {
            let mut inner = self.lock();
            // Dropping the slot kills the process if it is still running.
            inner.process = None;
            inner.last_error = Some(error.clone());
            if inner.state == WorkerState::Starting {
                self.set_state(&mut inner, WorkerState::Unhealthy);
            }
        }
        tracing::error!(worker = %self.config.name, error = %error, "Worker failed to start");
        let _ = self.health.send(HealthSignal::StartFailed {
            supervisor: self.config.name.clone(),
            error,
        });
    }

    /// Stop the worker: send `shutdown`, wait up to `grace` for the process
    /// to exit, then kill it. Always ends in `Stopped`.
    ///
    /// Interrupts a pending restart backoff. A stopped supervisor cannot be
    /// started again.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown.cancel();
        let _lifecycle = self.lifecycle.lock().await;

        let slot = {
            let mut inner = self.lock();
            if matches!(inner.state, WorkerState::Stopping | WorkerState::Stopped) {
                return;
            }
            self.set_state(&mut inner, WorkerState::Stopping);
            inner.process.take()
        };

        if let Some(mut slot) = slot {
            let mut exited = slot.exited.clone();
            let already_exited = exited.borrow().is_some();
            if !already_exited {
                if let Err(e) = slot.channel.notify(NOTIFY_SHUTDOWN, json!({})) {
                    tracing::debug!(worker = %self.config.name, error = %e, "Could not deliver shutdown notification");
                }
                if !wait_for_exit(&mut exited, grace).await {
                    tracing::warn!(
                        worker = %self.config.name,
                        grace_ms = grace.as_millis() as u64,
                        "Worker did not exit within grace period, killing",
                    );
                    if let Some(kill) = slot.kill.take() {
                        let _ = kill.send(());
                    }
                    wait_for_exit(&mut exited, KILL_WAIT).await;
                }
            }
            slot.channel.close();
        }

        let mut inner = self.lock();
        self.set_state(&mut inner, WorkerState::Stopped);
        tracing::info!(worker = %self.config.name, "Worker stopped");
    }

    /// Relaunch an `Unhealthy` worker with exponential backoff.
    ///
    /// See [`RestartOutcome`] for the possible results.
    pub async fn restart(self: &Arc<Self>) -> RestartOutcome {
        let _lifecycle = self.lifecycle.lock().await;
        restart::run(self).await
    }

    /// Clear an exhausted restart budget so the worker can be restarted
    /// again. Returns whether the budget had been exhausted.
    pub fn reset_restart_budget(&self) -> bool {
        let mut inner = self.lock();
        let was_exhausted = inner.restart_exhausted;
        inner.restart_attempts = 0;
        inner.restart_exhausted = false;
        if was_exhausted {
            tracing::info!(worker = %self.config.name, "Restart budget reset");
        }
        was_exhausted
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn publish(&self, event: CoordinatorEvent) {
        self.events.publish(event);
    }

    /// Account for one restart attempt and tear down the old process.
    ///
    /// Returns the 1-based attempt number, or the outcome to report when no
    /// attempt should be made.
    pub(crate) fn begin_restart_attempt(&self) -> Result<u32, RestartOutcome> {
        let mut inner = self.lock();
        match inner.state {
            WorkerState::Stopping | WorkerState::Stopped => return Err(RestartOutcome::Stopped),
            WorkerState::Unhealthy => {}
            _ => return Err(RestartOutcome::NotNeeded),
        }

        if inner.restart_exhausted {
            return Err(RestartOutcome::Exhausted {
                attempts: inner.restart_attempts,
            });
        }

        let max_attempts = self.config.restart.max_attempts;
        if inner.restart_attempts >= max_attempts {
            inner.restart_exhausted = true;
            tracing::error!(
                worker = %self.config.name,
                attempts = inner.restart_attempts,
                "Restart budget exhausted, worker stays unhealthy",
            );
            self.events.publish(CoordinatorEvent::WorkerFatal {
                supervisor: self.config.name.clone(),
                engine: self.config.engine,
                attempts: inner.restart_attempts,
            });
            return Err(RestartOutcome::Exhausted {
                attempts: inner.restart_attempts,
            });
        }

        inner.restart_attempts += 1;
        inner.process = None;
        self.set_state(&mut inner, WorkerState::Restarting);
        Ok(inner.restart_attempts)
    }

    pub(crate) fn restart_succeeded(&self) {
        self.lock().restart_attempts = 0;
    }

    // -- slots --------------------------------------------------------------

    /// Claim one slot if the worker is `Idle` with spare capacity.
    pub fn try_reserve(self: &Arc<Self>) -> Option<SlotLease> {
        let mut inner = self.lock();
        if inner.state != WorkerState::Idle {
            return None;
        }
        let slot = inner.process.as_mut()?;
        if slot.load >= slot.slots || slot.channel.is_closed() {
            return None;
        }
        slot.load += 1;
        let full = slot.load >= slot.slots;
        let lease = SlotLease {
            supervisor: Arc::clone(self),
            worker_id: slot.worker_id,
            channel: Arc::clone(&slot.channel),
        };
        if full {
            self.set_state(&mut inner, WorkerState::Busy);
        }
        Some(lease)
    }

    fn release_slot(&self, worker_id: WorkerId) {
        let mut inner = self.lock();
        let free = match inner.process.as_mut() {
            Some(slot) if slot.worker_id == worker_id => {
                slot.load = slot.load.saturating_sub(1);
                slot.load < slot.slots
            }
            // The lease outlived its process; the new process starts empty.
            _ => return,
        };
        match inner.state {
            WorkerState::Busy if free => {
                self.set_state(&mut inner, WorkerState::Idle);
            }
            WorkerState::Idle => self.availability.notify_one(),
            _ => {}
        }
    }

    /// Ask the current process to cancel `task_id`. `Ok` once the worker
    /// acknowledges.
    pub async fn cancel_task(&self, task_id: TaskId, timeout: Duration) -> Result<(), ChannelError> {
        let (_, channel) = self.current_channel()?;
        send_cancel(&channel, task_id, timeout).await
    }

    fn current_channel(&self) -> Result<(WorkerId, Arc<Channel>), ChannelError> {
        self.lock()
            .process
            .as_ref()
            .map(|p| (p.worker_id, Arc::clone(&p.channel)))
            .ok_or_else(|| ChannelError::Closed("worker has no running process".into()))
    }

    // -- health -------------------------------------------------------------

    /// Ask the current process for a `health_check` report.
    pub async fn check_health(&self, timeout: Duration) -> Result<HealthReport, ChannelError> {
        let (worker_id, channel) = self.current_channel()?;
        let value = channel.send(METHOD_HEALTH_CHECK, json!({}), timeout).await?;
        let report: HealthReport = serde_json::from_value(value)
            .map_err(|e| ChannelError::Protocol(format!("invalid health report: {e}")))?;
        tracing::debug!(worker = %self.config.name, worker_id = %worker_id, status = %report.status, "Health check answered");
        Ok(report)
    }

    /// Fetch `get_metrics` from the current process and keep the answer for
    /// [`snapshot`](Self::snapshot).
    pub async fn refresh_metrics(&self, timeout: Duration) -> Result<Value, ChannelError> {
        let (worker_id, channel) = self.current_channel()?;
        let metrics = channel.send(METHOD_GET_METRICS, json!({}), timeout).await?;
        let mut inner = self.lock();
        if let Some(slot) = inner.process.as_mut().filter(|p| p.worker_id == worker_id) {
            slot.metrics = Some(metrics.clone());
        }
        Ok(metrics)
    }

    pub fn snapshot(&self) -> WorkerStatus {
        let inner = self.lock();
        let process = inner.process.as_ref();
        WorkerStatus {
            supervisor: self.config.name.clone(),
            engine: self.config.engine,
            state: inner.state,
            worker_id: process.map(|p| p.worker_id),
            pid: process.and_then(|p| p.pid),
            load: process.map_or(0, |p| p.load),
            slots: process.map_or(self.config.slots.max(1), |p| p.slots),
            queue_size: process.map_or(0, |p| p.reported_queue),
            started_at: process.map(|p| p.started_at),
            last_heartbeat: process.map(|p| p.last_heartbeat),
            last_seen: process.map(|p| p.last_seen),
            metrics: process.and_then(|p| p.metrics.clone()),
            restart_attempts: inner.restart_attempts,
            restart_exhausted: inner.restart_exhausted,
            last_error: inner.last_error.clone(),
        }
    }

    /// Mark a running worker `Unhealthy` (e.g. after missed heartbeats) and
    /// close its channel so in-flight requests resolve as lost.
    ///
    /// Returns `false` if the worker was not running.
    pub fn mark_unhealthy(&self, reason: &str) -> bool {
        let channel = {
            let mut inner = self.lock();
            if !inner.state.is_running() {
                return false;
            }
            inner.last_error = Some(reason.to_string());
            self.set_state(&mut inner, WorkerState::Unhealthy);
            inner.process.as_ref().map(|p| Arc::clone(&p.channel))
        };
        tracing::warn!(worker = %self.config.name, reason, "Worker marked unhealthy");
        if let Some(channel) = channel {
            channel.close_with(CloseReason::Local(reason.to_string()));
        }
        true
    }

    fn record_heartbeat(&self, worker_id: WorkerId, heartbeat: &Heartbeat) {
        let mut inner = self.lock();
        let Some(slot) = inner.process.as_mut().filter(|p| p.worker_id == worker_id) else {
            return;
        };
        slot.last_heartbeat = Utc::now();
        slot.last_seen = Instant::now();
        slot.reported_queue = heartbeat.queue_size;
        if heartbeat.engine_id.parse::<EngineCapability>().ok() != Some(self.config.engine) {
            tracing::warn!(
                worker = %self.config.name,
                reported = %heartbeat.engine_id,
                "Heartbeat engine id does not match supervisor engine",
            );
        }
        tracing::trace!(
            worker = %self.config.name,
            status = ?heartbeat.status,
            reported_load = heartbeat.load,
            queue_size = heartbeat.queue_size,
            "Heartbeat",
        );
    }

    /// A process or channel belonging to `worker_id` went away.
    fn on_worker_lost(&self, worker_id: WorkerId, reason: String) {
        {
            let mut inner = self.lock();
            let current = inner.process.as_ref().map(|p| p.worker_id);
            // Stale processes and failed handshakes are handled elsewhere.
            if current != Some(worker_id) || !inner.state.is_running() {
                return;
            }
            inner.last_error = Some(reason.clone());
            self.set_state(&mut inner, WorkerState::Unhealthy);
        }

        tracing::warn!(
            worker = %self.config.name,
            worker_id = %worker_id,
            reason = %reason,
            "Worker lost",
        );
        let _ = self.health.send(HealthSignal::Exited {
            supervisor: self.config.name.clone(),
            worker_id,
            reason,
        });
    }
}

// ---------------------------------------------------------------------------
// SlotLease
// ---------------------------------------------------------------------------

/// One reserved slot on one specific worker process.
///
/// Dropping the lease releases the slot.
pub struct SlotLease {
    supervisor: Arc<WorkerSupervisor>,
    worker_id: WorkerId,
    channel: Arc<Channel>,
}

impl SlotLease {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn supervisor(&self) -> &str {
        self.supervisor.name()
    }

    pub fn engine(&self) -> EngineCapability {
        self.supervisor.engine()
    }

    /// Send one request on this worker and classify the result.
    pub async fn execute(&self, method: &str, params: Value, timeout: Duration) -> ExecutionOutcome {
        self.channel.send(method, params, timeout).await.into()
    }

    /// A handle for cancelling work on this process from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            worker_id: self.worker_id,
            channel: Arc::downgrade(&self.channel),
        }
    }

    /// Give the slot back. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.supervisor.release_slot(self.worker_id);
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("supervisor", &self.supervisor.name())
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Sends `cancel` requests to the process a lease was taken on.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    worker_id: WorkerId,
    channel: Weak<Channel>,
}

impl CancelHandle {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub async fn cancel(&self, task_id: TaskId, timeout: Duration) -> Result<(), ChannelError> {
        let channel = self
            .channel
            .upgrade()
            .ok_or_else(|| ChannelError::Closed("worker process is gone".into()))?;
        send_cancel(&channel, task_id, timeout).await
    }
}

async fn send_cancel(channel: &Channel, task_id: TaskId, timeout: Duration) -> Result<(), ChannelError> {
    let params = serde_json::to_value(CancelParams { task_id })
        .map_err(|e| ChannelError::Encode(e.to_string()))?;
    channel.send(METHOD_CANCEL, params, timeout).await.map(|_| ())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Wait for the process to exit (or be killed), then close its channel and
/// report the loss.
async fn watch_process(
    supervisor: Weak<WorkerSupervisor>,
    worker_id: WorkerId,
    mut process: Box<dyn ProcessHandle>,
    kill: oneshot::Receiver<()>,
    exited: watch::Sender<Option<ExitInfo>>,
    channel: Arc<Channel>,
) {
    // Either an explicit kill or the slot being dropped ends the process.
    let natural = tokio::select! {
        exit = process.wait() => Some(exit),
        _ = kill => None,
    };
    let exit = match natural {
        Some(exit) => exit,
        None => {
            process.kill().await;
            process.wait().await
        }
    };

    tracing::debug!(worker_id = %worker_id, exit = %exit, "Worker process exited");
    let reason = format!("worker process exited ({exit})");
    exited.send_replace(Some(exit));
    channel.close_with(CloseReason::Local(reason.clone()));

    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.on_worker_lost(worker_id, reason);
    }
}

/// Route heartbeats and notifications from one process to its supervisor.
async fn pump_events(
    supervisor: Weak<WorkerSupervisor>,
    worker_id: WorkerId,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::Heartbeat(hb) => supervisor.record_heartbeat(worker_id, &hb),
            ChannelEvent::Notification(n) if n.method == NOTIFY_PROGRESS => {
                match serde_json::from_value::<ProgressParams>(n.params) {
                    Ok(p) => supervisor.publish(CoordinatorEvent::TaskProgress {
                        task_id: p.task_id,
                        worker_id,
                        percent: p.percent,
                    }),
                    Err(e) => {
                        tracing::debug!(worker = %supervisor.name(), error = %e, "Ignoring malformed progress notification");
                    }
                }
            }
            ChannelEvent::Notification(n) => {
                tracing::debug!(worker = %supervisor.name(), method = %n.method, "Ignoring unknown notification");
            }
            ChannelEvent::Closed { reason } => {
                supervisor.on_worker_lost(worker_id, reason.to_string());
                break;
            }
        }
    }
}

/// Wait until the exit watch holds a value. Returns `false` on timeout.
async fn wait_for_exit(exited: &mut watch::Receiver<Option<ExitInfo>>, limit: Duration) -> bool {
    let wait = async {
        let _ = exited.wait_for(Option::is_some).await;
    };
    tokio::time::timeout(limit, wait).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_map_to_outcomes() {
        let lost: ExecutionOutcome = Err(ChannelError::Closed("eof".into())).into();
        assert_eq!(lost.error_code(), Some(ErrorCode::WorkerLost));

        let broken: ExecutionOutcome = Err(ChannelError::Protocol("bad frame".into())).into();
        assert_eq!(broken.error_code(), Some(ErrorCode::WorkerLost));

        let slow: ExecutionOutcome = Err(ChannelError::Timeout {
            method: "transcribe".into(),
            timeout: Duration::from_secs(1),
        })
        .into();
        assert_eq!(
            slow,
            ExecutionOutcome::TimedOut {
                after: Duration::from_secs(1)
            }
        );

        let failed: ExecutionOutcome = Err(ChannelError::Remote {
            code: "BAD_AUDIO".into(),
            message: "unreadable".into(),
        })
        .into();
        assert_eq!(failed.error_code(), Some(ErrorCode::TaskFailed));

        let ok: ExecutionOutcome = Ok(json!({"text": "hi"})).into();
        assert_eq!(ok.error_code(), None);
    }

    #[test]
    fn status_candidate_copies_selection_fields() {
        let status = WorkerStatus {
            supervisor: "whisper-0".into(),
            engine: EngineCapability::Whisper,
            state: WorkerState::Idle,
            worker_id: Some(WorkerId::new()),
            pid: Some(42),
            load: 1,
            slots: 2,
            queue_size: 0,
            started_at: Some(Utc::now()),
            last_heartbeat: None,
            last_seen: None,
            metrics: None,
            restart_attempts: 0,
            restart_exhausted: false,
            last_error: None,
        };
        let c = status.candidate(7usize);
        assert_eq!(c.key, 7);
        assert_eq!(c.engine, EngineCapability::Whisper);
        assert!(c.has_free_slot());
    }

    #[test]
    fn health_signal_names_supervisor() {
        let s = HealthSignal::StartFailed {
            supervisor: "funasr-1".into(),
            error: "boom".into(),
        };
        assert_eq!(s.supervisor(), "funasr-1");
    }
}
