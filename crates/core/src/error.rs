use std::fmt;

use serde::{Deserialize, Serialize};

/// Error codes surfaced to callers in task statuses and API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProcessStartFailed,
    RpcTimeout,
    ProtocolError,
    WorkerLost,
    RetriesExhausted,
    TaskNotFound,
    TaskCancelled,
    NoCapacity,
    /// The engine itself reported that it could not process the task.
    TaskFailed,
    /// The task's overall deadline elapsed.
    TaskTimeout,
    InvalidParams,
}

/// Coarse grouping of [`ErrorCode`]s used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Process,
    Scheduling,
    CallerInput,
    Task,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProcessStartFailed => "PROCESS_START_FAILED",
            ErrorCode::RpcTimeout => "RPC_TIMEOUT",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::WorkerLost => "WORKER_LOST",
            ErrorCode::RetriesExhausted => "RETRIES_EXHAUSTED",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::TaskCancelled => "TASK_CANCELLED",
            ErrorCode::NoCapacity => "NO_CAPACITY",
            ErrorCode::TaskFailed => "TASK_FAILED",
            ErrorCode::TaskTimeout => "TASK_TIMEOUT",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::RpcTimeout | ErrorCode::ProtocolError => ErrorCategory::Transport,
            ErrorCode::ProcessStartFailed | ErrorCode::WorkerLost => ErrorCategory::Process,
            ErrorCode::NoCapacity | ErrorCode::RetriesExhausted => ErrorCategory::Scheduling,
            ErrorCode::TaskNotFound | ErrorCode::InvalidParams => ErrorCategory::CallerInput,
            ErrorCode::TaskCancelled | ErrorCode::TaskFailed | ErrorCode::TaskTimeout => {
                ErrorCategory::Task
            }
        }
    }

    /// Transport and single-worker failures are retried without involving
    /// the caller; everything else is terminal.
    pub fn is_retryable(self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Process
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended in a failed state.
///
/// Renders as `CODE[,CODE...]: message`, e.g.
/// `WORKER_LOST,RETRIES_EXHAUSTED: worker exited with status 137`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub codes: Vec<ErrorCode>,
    pub message: String,
}

impl FailureCause {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            codes: vec![code],
            message: message.into(),
        }
    }

    /// Cause for a task whose last retryable failure used up the budget.
    pub fn retries_exhausted(last: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            codes: vec![last, ErrorCode::RetriesExhausted],
            message: message.into(),
        }
    }

    /// The first (most specific) code.
    pub fn primary(&self) -> Option<ErrorCode> {
        self.codes.first().copied()
    }

    pub fn has(&self, code: ErrorCode) -> bool {
        self.codes.contains(&code)
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<&str> = self.codes.iter().map(|c| c.as_str()).collect();
        write!(f, "{}: {}", codes.join(","), self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown engine capability: {0}")]
    UnknownCapability(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidParams
    }
}
