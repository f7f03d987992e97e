//! Priority queue of pending tasks with aging.
//!
//! Entries are ordered by effective priority (descending), then by
//! submission sequence (ascending). Effective priority grows with the time
//! spent waiting, so the order is computed on demand for a given instant
//! rather than kept in a heap.

use std::collections::HashMap;
use std::time::Duration;

use lingosub_core::scheduling::{effective_priority, queue_order, Priority};
use lingosub_core::types::TaskId;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    base: Priority,
    seq: u64,
    enqueued_at: Instant,
}

#[derive(Debug)]
pub struct TaskQueue {
    entries: HashMap<TaskId, Entry>,
    aging_threshold: Duration,
}

impl TaskQueue {
    pub fn new(aging_threshold: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            aging_threshold,
        }
    }

    /// Enqueue a task. `seq` is its submission sequence and is kept across
    /// requeues; `now` starts its aging clock.
    ///
    /// Returns `false` if the task is already queued.
    pub fn push(&mut self, task_id: TaskId, base: Priority, seq: u64, now: Instant) -> bool {
        if self.entries.contains_key(&task_id) {
            return false;
        }
        self.entries.insert(
            task_id,
            Entry {
                base,
                seq,
                enqueued_at: now,
            },
        );
        true
    }

    pub fn remove(&mut self, task_id: TaskId) -> bool {
        self.entries.remove(&task_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Effective priority of a queued task at `now`.
    pub fn priority_of(&self, task_id: TaskId, now: Instant) -> Option<Priority> {
        self.entries
            .get(&task_id)
            .map(|e| self.effective(e, now))
    }

    /// Queued task ids in dispatch order at `now`.
    pub fn ordered(&self, now: Instant) -> Vec<TaskId> {
        let mut keyed: Vec<(TaskId, Priority, u64)> = self
            .entries
            .iter()
            .map(|(id, e)| (*id, self.effective(e, now), e.seq))
            .collect();
        keyed.sort_by(|a, b| queue_order((a.1, a.2), (b.1, b.2)));
        keyed.into_iter().map(|(id, _, _)| id).collect()
    }

    fn effective(&self, entry: &Entry, now: Instant) -> Priority {
        let waited = now.saturating_duration_since(entry.enqueued_at);
        effective_priority(entry.base, waited, self.aging_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let now = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(60));
        queue.push(id(1), Priority::Low, 1, now);
        queue.push(id(2), Priority::High, 2, now);
        queue.push(id(3), Priority::Low, 3, now);
        queue.push(id(4), Priority::High, 4, now);

        assert_eq!(queue.ordered(now), vec![id(2), id(4), id(1), id(3)]);
    }

    #[test]
    fn duplicate_push_is_rejected() {
        let now = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(60));
        assert!(queue.push(id(1), Priority::Normal, 1, now));
        assert!(!queue.push(id(1), Priority::Urgent, 2, now));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.priority_of(id(1), now), Some(Priority::Normal));
    }

    #[test]
    fn aging_lets_a_waiting_task_overtake() {
        let start = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(10));
        queue.push(id(1), Priority::Low, 1, start);
        let later = start + Duration::from_secs(15);
        queue.push(id(2), Priority::Normal, 2, later);

        // Low aged by one level ties with Normal and wins on sequence.
        assert_eq!(queue.priority_of(id(1), later), Some(Priority::Normal));
        assert_eq!(queue.ordered(later), vec![id(1), id(2)]);
        // Before aging kicks in the Normal task goes first.
        assert_eq!(queue.ordered(start + Duration::from_secs(5)), vec![id(2), id(1)]);
    }

    #[test]
    fn requeue_resets_aging_but_keeps_sequence() {
        let start = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(10));
        queue.push(id(1), Priority::Low, 1, start);
        let later = start + Duration::from_secs(25);
        assert_eq!(queue.priority_of(id(1), later), Some(Priority::High));

        assert!(queue.remove(id(1)));
        assert_eq!(queue.priority_of(id(1), later), None);
        queue.push(id(1), Priority::Low, 1, later);
        assert_eq!(queue.priority_of(id(1), later), Some(Priority::Low));
    }

    #[test]
    fn remove_missing_is_false() {
        let mut queue = TaskQueue::new(Duration::from_secs(1));
        assert!(!queue.remove(id(9)));
        assert!(queue.is_empty());
    }
}
