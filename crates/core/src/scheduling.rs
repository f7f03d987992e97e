//! Task priorities, priority aging and the task state machine.
//!
//! This module lives in `core` (zero internal deps) so it can be used by
//! both the scheduler actor and any CLI tooling that renders task state.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority of a task. Higher variants dispatch first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn level(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    /// Map a numeric level back to a priority, clamping above `Urgent`.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Aging
// ---------------------------------------------------------------------------

/// Effective priority of a task that has been waiting for `waited`.
///
/// Every full `threshold` of waiting promotes the task by one level, up to
/// [`Priority::Urgent`]. A zero threshold disables aging.
pub fn effective_priority(base: Priority, waited: Duration, threshold: Duration) -> Priority {
    if threshold.is_zero() {
        return base;
    }
    let steps = (waited.as_nanos() / threshold.as_nanos()).min(u8::MAX as u128) as u8;
    Priority::from_level(base.level().saturating_add(steps))
}

/// Queue order: higher effective priority first, then lower submission
/// sequence (earlier submission) first.
pub fn queue_order(a: (Priority, u64), b: (Priority, u64)) -> Ordering {
    b.0.cmp(&a.0).then(a.1.cmp(&b.1))
}

// ---------------------------------------------------------------------------
// Task status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// Assigned to a worker and executing.
    Running,
    /// Cancellation requested while running; waiting for the worker to
    /// acknowledge or the in-flight request to resolve.
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod state_machine {
    use super::TaskStatus;

    /// Returns the set of statuses reachable from `from`.
    ///
    /// Terminal states (Completed, Failed, Cancelled) return an empty slice
    /// because no further transitions are allowed.
    pub fn valid_transitions(from: TaskStatus) -> &'static [TaskStatus] {
        match from {
            // Pending -> Running (dispatch), Cancelled, Failed (deadline)
            TaskStatus::Pending => &[TaskStatus::Running, TaskStatus::Cancelled, TaskStatus::Failed],
            // Running -> Pending (requeue), Completed, Failed, Cancelling
            TaskStatus::Running => &[
                TaskStatus::Pending,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelling,
            ],
            // Cancelling -> Cancelled
            TaskStatus::Cancelling => &[TaskStatus::Cancelled],
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => &[],
        }
    }

    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a transition, returning an error message for invalid ones.
    pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid task transition: {from} -> {to}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::*;

    // -- aging ----------------------------------------------------------------

    #[test]
    fn no_promotion_before_threshold() {
        let p = effective_priority(Priority::Low, Duration::from_secs(59), Duration::from_secs(60));
        assert_eq!(p, Priority::Low);
    }

    #[test]
    fn one_level_per_threshold() {
        let t = Duration::from_secs(60);
        assert_eq!(effective_priority(Priority::Low, Duration::from_secs(60), t), Priority::Normal);
        assert_eq!(effective_priority(Priority::Low, Duration::from_secs(130), t), Priority::High);
    }

    #[test]
    fn promotion_caps_at_urgent() {
        let p = effective_priority(Priority::Normal, Duration::from_secs(3600), Duration::from_secs(1));
        assert_eq!(p, Priority::Urgent);
    }

    #[test]
    fn zero_threshold_disables_aging() {
        let p = effective_priority(Priority::Low, Duration::from_secs(3600), Duration::ZERO);
        assert_eq!(p, Priority::Low);
    }

    // -- ordering -------------------------------------------------------------

    #[test]
    fn higher_priority_sorts_first() {
        let mut items = vec![(Priority::Low, 1), (Priority::High, 2), (Priority::Low, 3)];
        items.sort_by(|a, b| queue_order(*a, *b));
        assert_eq!(items, vec![(Priority::High, 2), (Priority::Low, 1), (Priority::Low, 3)]);
    }

    #[test]
    fn priority_defaults_to_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    // -- state machine --------------------------------------------------------

    #[test]
    fn pending_to_running() {
        assert!(can_transition(TaskStatus::Pending, TaskStatus::Running));
    }

    #[test]
    fn running_can_be_requeued() {
        assert!(can_transition(TaskStatus::Running, TaskStatus::Pending));
    }

    #[test]
    fn cancelling_only_reaches_cancelled() {
        assert_eq!(valid_transitions(TaskStatus::Cancelling), &[TaskStatus::Cancelled]);
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(valid_transitions(status).is_empty());
        }
    }

    #[test]
    fn invalid_transition_message() {
        let err = validate_transition(TaskStatus::Completed, TaskStatus::Running).unwrap_err();
        assert!(err.contains("completed -> running"));
    }
}
