//! Sidecar wire frames and parser.
//!
//! Every frame is one JSON object on its own line. Four shapes travel over
//! the pipe:
//!
//! - request: `{"id": 7, "method": "transcribe", "params": {...}, "timeout_ms": 1000}`
//! - response: `{"id": 7, "result": ...}` or `{"id": 7, "error": {"code": .., "message": ..}}`
//! - notification: `{"method": "progress", "params": {...}}`
//! - heartbeat: `{"engine_id": "whisper", "status": "alive", "load": 1, "queue_size": 0}`
//!
//! Frames carry no type tag, so inbound lines are decoded into a permissive
//! [`RawFrame`] first and then classified by which fields are present.

use lingosub_core::capability::EngineCapability;
use lingosub_core::types::TaskId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_GET_CAPABILITIES: &str = "get_capabilities";
pub const METHOD_TRANSCRIBE: &str = "transcribe";
pub const METHOD_CANCEL: &str = "cancel";
pub const METHOD_HEALTH_CHECK: &str = "health_check";
pub const METHOD_GET_METRICS: &str = "get_metrics";
pub const NOTIFY_SHUTDOWN: &str = "shutdown";
pub const NOTIFY_PROGRESS: &str = "progress";

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Correlated request. Sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Time the caller will wait for the response, in milliseconds.
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Response to a [`RequestFrame`], sent by the worker.
///
/// Exactly one of `result` and `error` is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl ResponseFrame {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

/// Uncorrelated message, valid in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl NotificationFrame {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Worker-reported liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Alive,
    Busy,
}

/// Periodic liveness report from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub engine_id: String,
    pub status: HeartbeatStatus,
    #[serde(default)]
    pub load: u32,
    #[serde(default)]
    pub queue_size: u32,
}

// ---------------------------------------------------------------------------
// Method payloads
// ---------------------------------------------------------------------------

/// Result of `get_capabilities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Engine names the worker can run. Unknown names are kept as strings
    /// so a newer worker does not fail the handshake outright.
    pub engines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<u32>,
}

impl Capabilities {
    /// Whether the advertised engine list contains `engine`.
    pub fn supports(&self, engine: EngineCapability) -> bool {
        self.engines
            .iter()
            .filter_map(|name| name.parse::<EngineCapability>().ok())
            .any(|e| e == engine)
    }
}

/// Result of `health_check`: `{"status": "healthy", "details": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `healthy`, or anything else (`unhealthy`, `error`) for a sick engine.
    pub status: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl HealthReport {
    pub const HEALTHY: &'static str = "healthy";

    pub fn healthy() -> Self {
        Self {
            status: Self::HEALTHY.into(),
            details: Value::Null,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Self::HEALTHY
    }
}

/// Params of `transcribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeParams {
    pub task_id: TaskId,
    #[serde(default)]
    pub payload: Value,
}

/// Params of `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub task_id: TaskId,
}

/// Params of the `progress` notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressParams {
    pub task_id: TaskId,
    pub percent: f64,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Errors raised while decoding a line.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unrecognised frame shape")]
    UnknownShape,
}

/// Union of every field any frame may carry.
#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RpcError>,
    timeout_ms: Option<u64>,
    engine_id: Option<String>,
    /// Only meaningful on heartbeats; results and notifications may carry
    /// their own `status` field of any shape.
    status: Option<Value>,
    load: Option<u32>,
    queue_size: Option<u32>,
}

/// A frame received by the coordinator from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFrame {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification(NotificationFrame),
    Heartbeat(Heartbeat),
}

/// A frame received by a worker from the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorFrame {
    Request(RequestFrame),
    Notification(NotificationFrame),
}

/// Classify one line written by a worker.
///
/// An `id` without a `method` is a response (`error` wins over `result`, and
/// a missing `result` means `null`). A `method` without an `id` is a
/// notification. `engine_id` plus `status` is a heartbeat. Anything else,
/// including worker-initiated requests, is [`FrameError::UnknownShape`].
pub fn parse_worker_frame(line: &str) -> Result<WorkerFrame, FrameError> {
    let raw: RawFrame = serde_json::from_str(line)?;

    match raw {
        RawFrame {
            id: Some(id),
            method: None,
            error: Some(error),
            ..
        } => Ok(WorkerFrame::Response {
            id,
            outcome: Err(error),
        }),
        RawFrame {
            id: Some(id),
            method: None,
            result,
            ..
        } => Ok(WorkerFrame::Response {
            id,
            outcome: Ok(result.unwrap_or(Value::Null)),
        }),
        RawFrame {
            id: None,
            method: Some(method),
            params,
            ..
        } => Ok(WorkerFrame::Notification(NotificationFrame {
            method,
            params: params.unwrap_or(Value::Null),
        })),
        RawFrame {
            id: None,
            engine_id: Some(engine_id),
            status: Some(status),
            load,
            queue_size,
            ..
        } => Ok(WorkerFrame::Heartbeat(Heartbeat {
            engine_id,
            status: serde_json::from_value(status)?,
            load: load.unwrap_or(0),
            queue_size: queue_size.unwrap_or(0),
        })),
        _ => Err(FrameError::UnknownShape),
    }
}

/// Classify one line written by the coordinator.
pub fn parse_coordinator_frame(line: &str) -> Result<CoordinatorFrame, FrameError> {
    let raw: RawFrame = serde_json::from_str(line)?;

    match raw {
        RawFrame {
            id: Some(id),
            method: Some(method),
            params,
            timeout_ms,
            ..
        } => Ok(CoordinatorFrame::Request(RequestFrame {
            id,
            method,
            params: params.unwrap_or(Value::Null),
            timeout_ms: timeout_ms.unwrap_or(0),
        })),
        RawFrame {
            id: None,
            method: Some(method),
            params,
            ..
        } => Ok(CoordinatorFrame::Notification(NotificationFrame {
            method,
            params: params.unwrap_or(Value::Null),
        })),
        _ => Err(FrameError::UnknownShape),
    }
}
