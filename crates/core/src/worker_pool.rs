//! Worker lifecycle state machine, liveness rules and selection policy.
//!
//! Pure functions and constants used by the supervisor, the pool and the
//! health monitor.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::EngineCapability;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default interval at which workers are expected to send heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A worker is considered dead once this many heartbeat intervals pass
/// without a heartbeat.
pub const DEFAULT_HEARTBEAT_MISS_FACTOR: u32 = 3;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Supervisor created, process never launched.
    Created,
    /// Process launched, capability handshake in progress.
    Starting,
    /// Up and has at least one free slot.
    Idle,
    /// Up and every slot is taken.
    Busy,
    /// Crashed, failed to start or missed heartbeats.
    Unhealthy,
    /// Waiting out the restart backoff.
    Restarting,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }

    /// Whether a live process is serving requests in this state.
    pub fn is_running(self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Busy)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod state_machine {
    use super::WorkerState;

    /// Returns the set of states reachable from `from`.
    pub fn valid_transitions(from: WorkerState) -> &'static [WorkerState] {
        use WorkerState::*;
        match from {
            Created => &[Starting, Stopping],
            Starting => &[Idle, Unhealthy, Stopping],
            Idle => &[Busy, Unhealthy, Stopping],
            Busy => &[Idle, Unhealthy, Stopping],
            Unhealthy => &[Restarting, Stopping],
            Restarting => &[Starting, Unhealthy, Stopping],
            Stopping => &[Stopped],
            Stopped => &[],
        }
    }

    pub fn can_transition(from: WorkerState, to: WorkerState) -> bool {
        valid_transitions(from).contains(&to)
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Whether a worker that has been silent for `silence` should be treated
/// as dead.
///
/// `silence` is measured on a monotonic clock by the caller. The cutoff is
/// strictly greater than `miss_factor * interval`.
pub fn heartbeat_expired(silence: Duration, interval: Duration, miss_factor: u32) -> bool {
    silence > interval.saturating_mul(miss_factor)
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The view of one worker the selection policy needs.
#[derive(Debug, Clone)]
pub struct WorkerCandidate<K> {
    pub key: K,
    pub engine: EngineCapability,
    pub state: WorkerState,
    pub load: u32,
    pub slots: u32,
    pub started_at: Option<Timestamp>,
}

impl<K> WorkerCandidate<K> {
    pub fn has_free_slot(&self) -> bool {
        self.load < self.slots
    }
}

/// Pick the worker a task accepting any of `accepted` engines should go to.
///
/// Only `Idle` workers with a free slot and a matching engine are eligible.
/// The least-loaded one wins; ties go to the worker started earliest.
pub fn select_worker<K: Clone>(
    candidates: &[WorkerCandidate<K>],
    accepted: &[EngineCapability],
) -> Option<K> {
    candidates
        .iter()
        .filter(|c| c.state == WorkerState::Idle && c.has_free_slot())
        .filter(|c| c.engine.satisfies(accepted))
        .min_by(|a, b| {
            a.load
                .cmp(&b.load)
                .then_with(|| match (a.started_at, b.started_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
        })
        .map(|c| c.key.clone())
}

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn candidate(key: u32, load: u32, started_secs_ago: i64) -> WorkerCandidate<u32> {
        WorkerCandidate {
            key,
            engine: EngineCapability::Whisper,
            state: WorkerState::Idle,
            load,
            slots: 2,
            started_at: Some(Utc::now() - ChronoDuration::seconds(started_secs_ago)),
        }
    }

    // -- state machine --------------------------------------------------------

    #[test]
    fn idle_busy_loop() {
        assert!(can_transition(WorkerState::Idle, WorkerState::Busy));
        assert!(can_transition(WorkerState::Busy, WorkerState::Idle));
    }

    #[test]
    fn restart_path() {
        assert!(can_transition(WorkerState::Unhealthy, WorkerState::Restarting));
        assert!(can_transition(WorkerState::Restarting, WorkerState::Starting));
        assert!(can_transition(WorkerState::Starting, WorkerState::Idle));
    }

    #[test]
    fn stopped_is_terminal() {
        assert!(valid_transitions(WorkerState::Stopped).is_empty());
    }

    #[test]
    fn unhealthy_cannot_serve() {
        assert!(!can_transition(WorkerState::Unhealthy, WorkerState::Idle));
    }

    // -- liveness -------------------------------------------------------------

    #[test]
    fn heartbeat_within_window_is_alive() {
        assert!(!heartbeat_expired(Duration::from_secs(14), Duration::from_secs(5), 3));
    }

    #[test]
    fn heartbeat_beyond_window_is_dead() {
        assert!(heartbeat_expired(Duration::from_secs(16), Duration::from_secs(5), 3));
    }

    #[test]
    fn silence_of_exactly_the_window_is_alive() {
        assert!(!heartbeat_expired(Duration::from_secs(15), Duration::from_secs(5), 3));
    }

    // -- selection ------------------------------------------------------------

    #[test]
    fn least_loaded_wins() {
        let cands = vec![candidate(1, 1, 100), candidate(2, 0, 10)];
        assert_eq!(select_worker(&cands, &[EngineCapability::Whisper]), Some(2));
    }

    #[test]
    fn ties_go_to_oldest() {
        let cands = vec![candidate(1, 0, 10), candidate(2, 0, 100)];
        assert_eq!(select_worker(&cands, &[EngineCapability::Whisper]), Some(2));
    }

    #[test]
    fn engine_mismatch_excluded() {
        let cands = vec![candidate(1, 0, 10)];
        assert_eq!(select_worker(&cands, &[EngineCapability::FunAsr]), None);
    }

    #[test]
    fn full_or_unhealthy_workers_excluded() {
        let mut full = candidate(1, 2, 10);
        full.state = WorkerState::Busy;
        let mut sick = candidate(2, 0, 10);
        sick.state = WorkerState::Unhealthy;
        assert_eq!(select_worker(&[full, sick], &[EngineCapability::Whisper]), None);
    }
}
