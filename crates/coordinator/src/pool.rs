//! The set of supervised workers and slot selection across them.
//!
//! [`WorkerPool::acquire`] never waits: it either hands out a
//! [`WorkerHandle`] for an idle worker with a free slot or fails with
//! [`PoolError::NoCapacity`]. Callers that want to wait for capacity await
//! [`WorkerPool::availability`], which supervisors notify whenever a slot
//! frees up or a worker becomes `Idle`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lingosub_core::capability::EngineCapability;
use lingosub_core::error::ErrorCode;
use lingosub_core::types::WorkerId;
use lingosub_core::worker_pool::{select_worker, WorkerCandidate};
use lingosub_events::EventBus;
use lingosub_sidecar::{
    HealthSignal, Launcher, SlotLease, SupervisorConfig, SupervisorError, WorkerStatus,
    WorkerSupervisor,
};
use tokio::sync::{mpsc, Notify};

/// A reserved slot on one worker. Dropping it releases the slot.
pub type WorkerHandle = SlotLease;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no worker available for engines {engines:?}")]
    NoCapacity { engines: Vec<EngineCapability> },
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::NoCapacity { .. } => ErrorCode::NoCapacity,
        }
    }
}

pub struct WorkerPool {
    supervisors: Vec<Arc<WorkerSupervisor>>,
    availability: Arc<Notify>,
}

impl WorkerPool {
    /// Create one supervisor per config. Workers are not launched until
    /// [`start_all`](Self::start_all).
    pub fn new(
        configs: Vec<SupervisorConfig>,
        launcher: Arc<dyn Launcher>,
        events: Arc<EventBus>,
        health: mpsc::UnboundedSender<HealthSignal>,
    ) -> Self {
        let availability = Arc::new(Notify::new());
        let supervisors = configs
            .into_iter()
            .map(|config| {
                WorkerSupervisor::new(
                    config,
                    Arc::clone(&launcher),
                    Arc::clone(&events),
                    health.clone(),
                    Arc::clone(&availability),
                )
            })
            .collect();
        Self {
            supervisors,
            availability,
        }
    }

    pub fn supervisors(&self) -> &[Arc<WorkerSupervisor>] {
        &self.supervisors
    }

    pub fn get(&self, name: &str) -> Option<&Arc<WorkerSupervisor>> {
        self.supervisors.iter().find(|s| s.name() == name)
    }

    /// Notified whenever capacity may have appeared.
    pub fn availability(&self) -> Arc<Notify> {
        Arc::clone(&self.availability)
    }

    /// Whether any configured worker provides one of `engines`.
    pub fn serves_any(&self, engines: &[EngineCapability]) -> bool {
        self.supervisors
            .iter()
            .any(|s| s.engine().satisfies(engines))
    }

    /// Reserve a slot on the best idle worker accepting any of `engines`.
    ///
    /// Prefers the least-loaded worker, then the one started earliest.
    pub fn acquire(&self, engines: &[EngineCapability]) -> Result<WorkerHandle, PoolError> {
        let mut candidates: Vec<WorkerCandidate<usize>> = self
            .supervisors
            .iter()
            .enumerate()
            .filter(|(_, s)| s.engine().satisfies(engines))
            .map(|(i, s)| s.snapshot().candidate(i))
            .collect();

        // A worker can change state between the snapshot and the
        // reservation; fall through to the next best one when that happens.
        while let Some(index) = select_worker(&candidates, engines) {
            if let Some(lease) = self.supervisors[index].try_reserve() {
                tracing::debug!(
                    worker = self.supervisors[index].name(),
                    worker_id = %lease.worker_id(),
                    "Slot acquired",
                );
                return Ok(lease);
            }
            candidates.retain(|c| c.key != index);
        }

        Err(PoolError::NoCapacity {
            engines: engines.to_vec(),
        })
    }

    /// Give a slot back. Equivalent to dropping the handle.
    pub fn release(&self, handle: WorkerHandle) {
        handle.release();
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.supervisors.iter().map(|s| s.snapshot()).collect()
    }

    /// Launch every worker concurrently. Failures are reported per worker
    /// and leave that worker `Unhealthy` for the health monitor to handle.
    pub async fn start_all(&self) -> Vec<(String, Result<WorkerId, SupervisorError>)> {
        let starts = self
            .supervisors
            .iter()
            .map(|s| async move { (s.name().to_string(), s.start().await) });
        join_all(starts).await
    }

    /// Stop every worker concurrently, each within `grace`.
    pub async fn stop_all(&self, grace: Duration) {
        join_all(self.supervisors.iter().map(|s| s.stop(grace))).await;
        tracing::info!(workers = self.supervisors.len(), "All workers stopped");
    }
}
