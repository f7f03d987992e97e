//! The coordinator facade: wires pool, scheduler, aggregator and health
//! monitor together and exposes the caller-facing API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lingosub_core::capability::{validate_engine_set, EngineCapability};
use lingosub_core::error::ErrorCode;
use lingosub_core::scheduling::Priority;
use lingosub_core::types::TaskId;
use lingosub_events::{EventBus, EventEnvelope};
use lingosub_sidecar::{Launcher, WorkerStatus};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregatorError, ComparisonResult, ResultAggregator};
use crate::config::CoordinatorConfig;
use crate::health::HealthMonitor;
use crate::pool::WorkerPool;
use crate::scheduler::{Scheduler, SchedulerError, TaskRequest, TaskSnapshot};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

impl CoordinatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::Scheduler(e) => e.code(),
            CoordinatorError::Aggregator(e) => e.code(),
        }
    }
}

/// What [`Coordinator::submit_comparison`] created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonTicket {
    /// Id of the logical task; use it with [`Coordinator::comparison`].
    pub group: TaskId,
    /// One task per engine that was accepted.
    pub tasks: Vec<(EngineCapability, TaskId)>,
}

type GroupTable = HashMap<TaskId, Vec<TaskId>>;

/// Forget groups the aggregator no longer knows about.
fn prune_groups(groups: &Mutex<GroupTable>, aggregator: &ResultAggregator) {
    let mut groups = groups.lock().unwrap_or_else(PoisonError::into_inner);
    let before = groups.len();
    groups.retain(|group, _| aggregator.is_registered(*group));
    if groups.len() < before {
        tracing::debug!(pruned = before - groups.len(), "Comparison groups pruned");
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    pool: Arc<WorkerPool>,
    scheduler: Scheduler,
    aggregator: Arc<ResultAggregator>,
    events: Arc<EventBus>,
    groups: Arc<Mutex<GroupTable>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    health_cancel: CancellationToken,
}

impl Coordinator {
    /// Build every component and spawn the scheduler and health monitor.
    /// Workers are launched by [`start_workers`](Self::start_workers).
    pub fn new(config: CoordinatorConfig, launcher: Arc<dyn Launcher>) -> Self {
        let events = Arc::new(EventBus::default());
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::new(
            config.supervisor_configs(),
            launcher,
            Arc::clone(&events),
            health_tx,
        ));
        let aggregator = Arc::new(
            ResultAggregator::new(config.scoring, Arc::clone(&events))
                .with_retention(config.retained_comparisons),
        );

        let (scheduler, scheduler_task) = Scheduler::spawn(
            config.scheduler.clone(),
            Arc::clone(&pool),
            Arc::clone(&aggregator),
            Arc::clone(&events),
        );
        let health_cancel = CancellationToken::new();
        let health_task = HealthMonitor::new(
            Arc::clone(&pool),
            Arc::clone(&events),
            config.health.clone(),
        )
        .spawn(health_rx, health_cancel.clone());

        Self {
            config,
            pool,
            scheduler,
            aggregator,
            events,
            groups: Arc::new(Mutex::new(HashMap::new())),
            background: Mutex::new(vec![scheduler_task, health_task]),
            health_cancel,
        }
    }

    /// [`new`](Self::new) followed by [`start_workers`](Self::start_workers).
    pub async fn start(config: CoordinatorConfig, launcher: Arc<dyn Launcher>) -> Self {
        let coordinator = Self::new(config, launcher);
        coordinator.start_workers().await;
        coordinator
    }

    /// Launch every configured worker. Returns how many came up; the rest
    /// are left to the health monitor's restart policy.
    pub async fn start_workers(&self) -> usize {
        let results = self.pool.start_all().await;
        let ready = results.iter().filter(|(_, r)| r.is_ok()).count();
        tracing::info!(ready, configured = results.len(), "Workers started");
        ready
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn groups(&self) -> MutexGuard<'_, GroupTable> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, CoordinatorError> {
        Ok(self.scheduler.submit(request).await?)
    }

    /// Run the same payload on each of `engines` and compare the results.
    ///
    /// Engines that cannot take the task count as failed in the
    /// comparison; the call only errors when none of them could.
    pub async fn submit_comparison(
        &self,
        engines: &[EngineCapability],
        payload: Value,
        priority: Priority,
    ) -> Result<ComparisonTicket, CoordinatorError> {
        validate_engine_set(engines).map_err(|e| SchedulerError::InvalidParams(e.to_string()))?;

        let group = self.scheduler.allocate_id();
        self.aggregator.register_expectation(group, engines)?;

        let mut tasks = Vec::with_capacity(engines.len());
        let mut first_error = None;
        for &engine in engines {
            let request = TaskRequest::new(vec![engine], payload.clone())
                .with_priority(priority)
                .in_group(group);
            match self.scheduler.submit(request).await {
                Ok(id) => tasks.push((engine, id)),
                Err(e) => {
                    tracing::warn!(group = %group, engine = %engine, error = %e, "Comparison engine rejected");
                    let _ = self.aggregator.record_failure(group, engine);
                    first_error.get_or_insert(e);
                }
            }
        }
        if tasks.is_empty() {
            if let Some(e) = first_error {
                return Err(e.into());
            }
        }

        self.groups()
            .insert(group, tasks.iter().map(|(_, id)| *id).collect());

        // Freeze the comparison once all engines report or the wait ends,
        // so `ComparisonReady` fires even if nobody asks for it.
        let aggregator = Arc::clone(&self.aggregator);
        let groups = Arc::clone(&self.groups);
        let timeout = self.config.aggregation_timeout;
        tokio::spawn(async move {
            if let Err(e) = aggregator.await_comparison(group, timeout).await {
                tracing::warn!(group = %group, error = %e, "Comparison could not be finalized");
            }
            prune_groups(&groups, &aggregator);
        });

        tracing::info!(group = %group, tasks = tasks.len(), "Comparison submitted");
        Ok(ComparisonTicket { group, tasks })
    }

    /// Cancel a task, or every task of a comparison group.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, CoordinatorError> {
        let children = self.groups().get(&id).cloned();
        match children {
            Some(children) => {
                let mut any = false;
                for child in children {
                    any |= self.scheduler.cancel(child).await?;
                }
                Ok(any)
            }
            None => Ok(self.scheduler.cancel(id).await?),
        }
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskSnapshot, CoordinatorError> {
        Ok(self.scheduler.status(id).await?)
    }

    /// Resolve once the task is terminal.
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot, CoordinatorError> {
        Ok(self.scheduler.wait(id).await?)
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskSnapshot>, CoordinatorError> {
        Ok(self.scheduler.list().await?)
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.pool.snapshot()
    }

    /// The comparison for `group`, waiting up to the aggregation timeout.
    pub async fn comparison(&self, group: TaskId) -> Result<ComparisonResult, CoordinatorError> {
        let result = self
            .aggregator
            .await_comparison(group, self.config.aggregation_timeout)
            .await;
        prune_groups(&self.groups, &self.aggregator);
        Ok(result?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Cancel open tasks, stop background tasks and stop every worker
    /// within the configured grace period.
    pub async fn shutdown(&self) {
        tracing::info!("Coordinator shutting down");
        self.scheduler.shutdown();
        self.health_cancel.cancel();

        let background: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in background {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }

        self.pool.stop_all(self.config.stop_grace).await;
        tracing::info!("Coordinator stopped");
    }
}
