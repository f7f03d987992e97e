use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a submitted task.
///
/// Allocated from a monotonically increasing counter; never reused for the
/// lifetime of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Hands out fresh [`TaskId`]s, starting at 1.
#[derive(Debug)]
pub struct TaskIdAllocator {
    next: AtomicU64,
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TaskIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of one launched worker process.
///
/// A restarted worker gets a new id even when it reuses the same
/// supervisor slot, command line or OS resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Generate a fresh, time-ordered worker id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_never_reused() {
        let alloc = TaskIdAllocator::new();
        let ids: Vec<TaskId> = (0..100).map(|_| alloc.allocate()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(ids[0], TaskId::from_raw(1));
    }

    #[test]
    fn task_id_display() {
        assert_eq!(TaskId::from_raw(42).to_string(), "task-42");
    }

    #[test]
    fn worker_ids_differ() {
        assert_ne!(WorkerId::new(), WorkerId::new());
    }

    #[test]
    fn task_id_serializes_as_number() {
        let json = serde_json::to_string(&TaskId::from_raw(7)).unwrap();
        assert_eq!(json, "7");
    }
}
