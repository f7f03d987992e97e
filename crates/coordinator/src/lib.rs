//! Coordinator for a pool of speech-recognition worker processes.
//!
//! - [`pool`]: the supervised workers and slot selection.
//! - [`queue`] and [`scheduler`]: the priority queue and the actor that
//!   dispatches, retries, cancels and times out tasks.
//! - [`aggregator`]: multi-engine comparisons.
//! - [`health`]: heartbeat sweeps and restarts.
//! - [`coordinator`]: the facade tying them together.
//! - [`config`]: environment and engines-file configuration.

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod pool;
pub mod queue;
pub mod scheduler;

pub use aggregator::{ComparisonResult, ComparisonStatus, EngineResult, ResultAggregator};
pub use config::{ConfigError, CoordinatorConfig, EngineSpec};
pub use coordinator::{ComparisonTicket, Coordinator, CoordinatorError};
pub use health::{HealthConfig, HealthMonitor};
pub use pool::{PoolError, WorkerHandle, WorkerPool};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, TaskRequest, TaskSnapshot};
