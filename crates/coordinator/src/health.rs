//! Health monitor: reacts to worker loss and detects silent or sick
//! workers.
//!
//! Runs as one task. Supervisors report launch failures and process exits
//! as [`HealthSignal`]s; a periodic sweep marks running workers whose
//! heartbeats stopped as `Unhealthy`, and a slower check round asks each
//! running worker for `health_check` and `get_metrics`. Whatever the cause,
//! the worker is restarted in a spawned task, at most one restart per
//! worker at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use lingosub_core::worker_pool::{
    heartbeat_expired, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_MISS_FACTOR,
};
use lingosub_events::{CoordinatorEvent, EventBus};
use lingosub_sidecar::{HealthSignal, RestartOutcome, WorkerSupervisor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::pool::WorkerPool;

/// Default period of the `health_check` round.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a worker has to answer `health_check`.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Expected heartbeat period, also the sweep period.
    pub heartbeat_interval: Duration,
    /// Heartbeats that may be missed before a worker counts as dead.
    pub miss_factor: u32,
    /// Period of the `health_check` round; `None` disables it.
    pub check_interval: Option<Duration>,
    /// Time allowed for each `health_check` and `get_metrics` call.
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            miss_factor: DEFAULT_HEARTBEAT_MISS_FACTOR,
            check_interval: Some(DEFAULT_HEALTH_CHECK_INTERVAL),
            check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    pool: Arc<WorkerPool>,
    events: Arc<EventBus>,
    config: HealthConfig,
    /// Supervisors with a restart in flight.
    restarting: Arc<Mutex<HashSet<String>>>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<WorkerPool>, events: Arc<EventBus>, config: HealthConfig) -> Self {
        Self {
            pool,
            events,
            config,
            restarting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(
        self,
        signals: mpsc::UnboundedReceiver<HealthSignal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(signals, cancel))
    }

    /// Process signals and sweep heartbeats until `cancel` fires.
    pub async fn run(
        self,
        mut signals: mpsc::UnboundedReceiver<HealthSignal>,
        cancel: CancellationToken,
    ) {
        // A zero period would panic `interval`.
        let floor = Duration::from_millis(1);
        let mut sweep = tokio::time::interval(self.config.heartbeat_interval.max(floor));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checks = self.config.check_interval.map(|period| {
            let start = Instant::now() + period;
            let mut checks = tokio::time::interval_at(start, period.max(floor));
            checks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            checks
        });
        let mut round: Option<JoinHandle<Vec<String>>> = None;
        tracing::info!(
            heartbeat_interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            miss_factor = self.config.miss_factor,
            check_interval_ms = self.config.check_interval.map(|d| d.as_millis() as u64),
            "Health monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Health monitor shutting down");
                    break;
                }
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
                _ = next_tick(&mut checks) => {
                    if round.as_ref().is_some_and(|r| !r.is_finished()) {
                        tracing::debug!("Previous health check round still running");
                        continue;
                    }
                    let monitor = self.clone();
                    round = Some(tokio::spawn(async move { monitor.check_round().await }));
                }
            }
        }
        if let Some(round) = round {
            round.abort();
        }
    }

    fn handle_signal(&self, signal: HealthSignal) {
        match &signal {
            HealthSignal::StartFailed { supervisor, error } => {
                tracing::warn!(worker = %supervisor, error = %error, "Worker failed to start");
            }
            HealthSignal::Exited {
                supervisor,
                worker_id,
                reason,
            } => {
                tracing::warn!(worker = %supervisor, worker_id = %worker_id, reason = %reason, "Worker exited");
            }
        }
        self.schedule_restart(signal.supervisor());
    }

    /// Mark running workers that went silent as `Unhealthy` and restart
    /// them. Returns the names of the workers marked.
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let mut marked = Vec::new();
        for supervisor in self.pool.supervisors() {
            let status = supervisor.snapshot();
            if !status.state.is_running() {
                continue;
            }
            let Some(last_seen) = status.last_seen else {
                continue;
            };
            let silence = now.saturating_duration_since(last_seen);
            if !heartbeat_expired(silence, self.config.heartbeat_interval, self.config.miss_factor) {
                continue;
            }

            let silent_for_ms = silence.as_millis() as u64;
            if supervisor.mark_unhealthy(&format!("no heartbeat for {silent_for_ms}ms")) {
                tracing::warn!(worker = supervisor.name(), silent_for_ms, "Worker missed heartbeats");
                self.events.publish(CoordinatorEvent::WorkerHeartbeatMissed {
                    supervisor: supervisor.name().to_string(),
                    worker_id: status.worker_id,
                    silent_for_ms,
                });
                self.schedule_restart(supervisor.name());
                marked.push(supervisor.name().to_string());
            }
        }
        marked
    }

    /// Ask every running worker for `health_check`, concurrently. Workers
    /// that answer anything but healthy, or fail to answer in time, are
    /// marked `Unhealthy` and restarted; healthy ones get their metrics
    /// refreshed. Returns the names of the workers marked.
    pub async fn check_round(&self) -> Vec<String> {
        let running: Vec<Arc<WorkerSupervisor>> = self
            .pool
            .supervisors()
            .iter()
            .filter(|s| s.state().is_running())
            .cloned()
            .collect();
        let verdicts = join_all(running.iter().map(|s| self.check_one(s))).await;
        running
            .iter()
            .zip(verdicts)
            .filter(|(_, marked)| *marked)
            .map(|(s, _)| s.name().to_string())
            .collect()
    }

    async fn check_one(&self, supervisor: &Arc<WorkerSupervisor>) -> bool {
        let worker_id = supervisor.snapshot().worker_id;
        let timeout = self.config.check_timeout;
        let reason = match supervisor.check_health(timeout).await {
            Ok(report) if report.is_healthy() => {
                if let Err(e) = supervisor.refresh_metrics(timeout).await {
                    tracing::debug!(worker = supervisor.name(), error = %e, "Metrics unavailable");
                }
                return false;
            }
            Ok(report) => format!("health check reported '{}'", report.status),
            Err(e) => format!("health check failed: {e}"),
        };

        // The process may have been replaced while we waited.
        if supervisor.snapshot().worker_id != worker_id || !supervisor.mark_unhealthy(&reason) {
            return false;
        }
        tracing::warn!(worker = supervisor.name(), reason = %reason, "Worker failed health check");
        self.events.publish(CoordinatorEvent::WorkerHealthCheckFailed {
            supervisor: supervisor.name().to_string(),
            worker_id,
            reason,
        });
        self.schedule_restart(supervisor.name());
        true
    }

    fn schedule_restart(&self, name: &str) {
        let Some(supervisor) = self.pool.get(name).cloned() else {
            tracing::warn!(worker = %name, "Health signal for unknown worker");
            return;
        };
        {
            let mut restarting = self.restarting.lock().unwrap_or_else(PoisonError::into_inner);
            if !restarting.insert(name.to_string()) {
                tracing::debug!(worker = %name, "Restart already in progress");
                return;
            }
        }

        let restarting = Arc::clone(&self.restarting);
        tokio::spawn(async move {
            match supervisor.restart().await {
                RestartOutcome::Restarted(worker_id) => {
                    tracing::info!(worker = supervisor.name(), worker_id = %worker_id, "Worker restarted");
                }
                RestartOutcome::Exhausted { attempts } => {
                    tracing::error!(worker = supervisor.name(), attempts, "Worker gave up restarting");
                }
                outcome => {
                    tracing::debug!(worker = supervisor.name(), outcome = ?outcome, "No restart performed");
                }
            }
            restarting
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(supervisor.name());
        });
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
