//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the supervisors, the
//! scheduler, the aggregator and the health monitor.

use chrono::Utc;
use lingosub_core::capability::EngineCapability;
use lingosub_core::error::FailureCause;
use lingosub_core::scheduling::TaskStatus;
use lingosub_core::types::{TaskId, Timestamp, WorkerId};
use lingosub_core::worker_pool::WorkerState;
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// CoordinatorEvent
// ---------------------------------------------------------------------------

/// Something observable that happened inside the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// A supervised worker moved between lifecycle states.
    WorkerStateChanged {
        supervisor: String,
        engine: EngineCapability,
        worker_id: Option<WorkerId>,
        from: WorkerState,
        to: WorkerState,
    },

    /// A worker stayed silent longer than the heartbeat window.
    WorkerHeartbeatMissed {
        supervisor: String,
        worker_id: Option<WorkerId>,
        silent_for_ms: u64,
    },

    /// A worker answered `health_check` as unhealthy, or not at all.
    WorkerHealthCheckFailed {
        supervisor: String,
        worker_id: Option<WorkerId>,
        reason: String,
    },

    /// A restart attempt was scheduled after the given delay.
    WorkerRestartScheduled {
        supervisor: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// A worker used up its restart budget and stays unhealthy.
    WorkerFatal {
        supervisor: String,
        engine: EngineCapability,
        attempts: u32,
    },

    /// A task changed status.
    TaskStatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        worker_id: Option<WorkerId>,
        cause: Option<FailureCause>,
    },

    /// A worker reported progress on a running task.
    TaskProgress {
        task_id: TaskId,
        worker_id: WorkerId,
        percent: f64,
    },

    /// A comparison artifact was produced.
    ComparisonReady { task_id: TaskId, partial: bool },
}

/// A [`CoordinatorEvent`] stamped with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: CoordinatorEvent,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use lingosub_events::bus::{CoordinatorEvent, EventBus};
/// use lingosub_core::types::TaskId;
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(CoordinatorEvent::ComparisonReady {
///     task_id: TaskId::from_raw(1),
///     partial: false,
/// });
/// ```
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: CoordinatorEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(EventEnvelope {
            event,
            timestamp: Utc::now(),
        });
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(CoordinatorEvent::TaskStatusChanged {
            task_id: TaskId::from_raw(3),
            status: TaskStatus::Running,
            worker_id: None,
            cause: None,
        });

        let received = rx.recv().await.expect("should receive the event");
        match received.event {
            CoordinatorEvent::TaskStatusChanged {
                task_id, status, ..
            } => {
                assert_eq!(task_id, TaskId::from_raw(3));
                assert_eq!(status, TaskStatus::Running);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(CoordinatorEvent::ComparisonReady {
            task_id: TaskId::from_raw(1),
            partial: true,
        });

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert!(matches!(e1.event, CoordinatorEvent::ComparisonReady { partial: true, .. }));
        assert!(matches!(e2.event, CoordinatorEvent::ComparisonReady { partial: true, .. }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(CoordinatorEvent::WorkerRestartScheduled {
            supervisor: "whisper-0".into(),
            attempt: 1,
            delay_ms: 1000,
        });
    }

    #[test]
    fn envelope_serializes_flat_with_type_tag() {
        let envelope = EventEnvelope {
            event: CoordinatorEvent::WorkerFatal {
                supervisor: "funasr-1".into(),
                engine: EngineCapability::FunAsr,
                attempts: 5,
            },
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "worker_fatal");
        assert_eq!(json["engine"], "funasr");
        assert_eq!(json["attempts"], 5);
        assert!(json["timestamp"].is_string());
    }
}
