//! Sidecar worker process plumbing.
//!
//! Speech-recognition engines run as long-lived child processes
//! ("sidecars") that speak newline-delimited JSON over stdin/stdout. This
//! crate provides:
//!
//! - [`messages`]: typed wire frames and their parser.
//! - [`channel`]: the correlated request/response transport to one
//!   process.
//! - [`launcher`]: the seam that starts processes (real or in-memory).
//! - [`supervisor`]: lifecycle, slot accounting and crash detection for
//!   one worker.
//! - [`restart`]: the backoff-driven restart loop.

pub mod channel;
pub mod launcher;
pub mod messages;
pub mod restart;
pub mod supervisor;

pub use channel::{Channel, ChannelConfig, ChannelError, ChannelEvent, CloseReason};
pub use launcher::{
    ExitInfo, LaunchError, LaunchedWorker, Launcher, ProcessHandle, ProcessLauncher,
    WorkerCommand,
};
pub use restart::RestartOutcome;
pub use supervisor::{
    CancelHandle, ExecutionOutcome, HealthSignal, SlotLease, SupervisorConfig, SupervisorError,
    WorkerStatus, WorkerSupervisor,
};
