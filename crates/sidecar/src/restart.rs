//! Exponential-backoff restart of an unhealthy worker.
//!
//! [`run`] keeps relaunching the worker until a launch succeeds, the
//! supervisor is stopped, or the restart budget
//! ([`BackoffConfig::max_attempts`](lingosub_core::backoff::BackoffConfig))
//! runs out. Each attempt first waits a jittered delay from
//! [`lingosub_core::backoff`].

use std::sync::Arc;

use lingosub_core::backoff::{delay_for_attempt, jittered};
use lingosub_core::types::WorkerId;
use lingosub_events::CoordinatorEvent;

use crate::supervisor::{SupervisorError, WorkerSupervisor};

/// Result of [`WorkerSupervisor::restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// A new process passed its handshake.
    Restarted(WorkerId),
    /// The budget is used up; the worker stays `Unhealthy` until
    /// [`WorkerSupervisor::reset_restart_budget`] is called.
    Exhausted { attempts: u32 },
    /// The supervisor was stopped before or during the restart.
    Stopped,
    /// The worker is not `Unhealthy` (already restarted, or never started).
    NotNeeded,
}

/// Restart loop. The caller holds the supervisor's lifecycle lock.
pub(crate) async fn run(supervisor: &Arc<WorkerSupervisor>) -> RestartOutcome {
    let backoff = supervisor.config().restart.clone();

    loop {
        let attempt = match supervisor.begin_restart_attempt() {
            Ok(attempt) => attempt,
            Err(outcome) => return outcome,
        };

        let delay = jittered(delay_for_attempt(attempt, &backoff));
        tracing::info!(
            worker = supervisor.name(),
            attempt,
            max_attempts = backoff.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Restarting worker",
        );
        supervisor.publish(CoordinatorEvent::WorkerRestartScheduled {
            supervisor: supervisor.name().to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        // Wait out the backoff, respecting shutdown.
        tokio::select! {
            _ = supervisor.shutdown_token().cancelled() => {
                tracing::info!(worker = supervisor.name(), "Restart cancelled");
                return RestartOutcome::Stopped;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match supervisor.start_locked().await {
            Ok(worker_id) => {
                supervisor.restart_succeeded();
                tracing::info!(
                    worker = supervisor.name(),
                    worker_id = %worker_id,
                    attempt,
                    "Worker restarted",
                );
                return RestartOutcome::Restarted(worker_id);
            }
            Err(SupervisorError::Stopped(_)) => return RestartOutcome::Stopped,
            Err(e) => {
                tracing::warn!(
                    worker = supervisor.name(),
                    error = %e,
                    "Restart attempt {attempt} failed",
                );
            }
        }
    }
}
