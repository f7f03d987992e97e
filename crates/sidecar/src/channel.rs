//! Correlated request/response transport to one worker process.
//!
//! A [`Channel`] owns two background tasks: a writer that drains an
//! outbound queue into the worker's stdin, and a reader that decodes lines
//! from the worker's stdout. Responses are routed to the waiter holding the
//! matching correlation id; notifications and heartbeats are forwarded to
//! the owner as [`ChannelEvent`]s.
//!
//! The channel closes exactly once, on EOF, on an I/O or protocol error, or
//! on [`Channel::close`]. Closing fails every pending waiter with the close
//! error, and the event stream ends with [`ChannelEvent::Closed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lingosub_core::error::ErrorCode;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::messages::{
    parse_worker_frame, Heartbeat, NotificationFrame, RequestFrame, RpcError, WorkerFrame,
};

/// Default bound on concurrently pending requests.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Default maximum length of one inbound line (8 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Tuning for one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_in_flight: usize,
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Errors surfaced by [`Channel`] operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("request '{method}' timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("{0} requests already in flight")]
    Backpressure(usize),

    #[error("worker error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ChannelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChannelError::Timeout { .. } => ErrorCode::RpcTimeout,
            ChannelError::Protocol(_) => ErrorCode::ProtocolError,
            ChannelError::Closed(_) => ErrorCode::WorkerLost,
            ChannelError::Backpressure(_) => ErrorCode::NoCapacity,
            ChannelError::Remote { .. } => ErrorCode::TaskFailed,
            ChannelError::Encode(_) => ErrorCode::InvalidParams,
        }
    }
}

impl From<RpcError> for ChannelError {
    fn from(e: RpcError) -> Self {
        ChannelError::Remote {
            code: e.code,
            message: e.message,
        }
    }
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The worker closed its stdout.
    Eof,
    /// The worker wrote a frame that could not be classified.
    Protocol(String),
    /// Reading or writing the pipe failed.
    Io(String),
    /// [`Channel::close`] was called or the channel was dropped.
    Local(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("worker closed its output"),
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            CloseReason::Io(msg) => write!(f, "i/o error: {msg}"),
            CloseReason::Local(msg) => f.write_str(msg),
        }
    }
}

impl CloseReason {
    fn to_error(&self) -> ChannelError {
        match self {
            CloseReason::Protocol(msg) => ChannelError::Protocol(msg.clone()),
            other => ChannelError::Closed(other.to_string()),
        }
    }
}

/// Uncorrelated inbound traffic, delivered to the channel owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Notification(NotificationFrame),
    Heartbeat(Heartbeat),
    /// Always the last event.
    Closed { reason: CloseReason },
}

type Waiter = oneshot::Sender<Result<Value, ChannelError>>;

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u64, Waiter>,
    closed: Option<ChannelError>,
}

struct Shared {
    label: String,
    pending: Mutex<PendingTable>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> ChannelError {
        self.table()
            .closed
            .clone()
            .unwrap_or_else(|| ChannelError::Closed("channel closed".into()))
    }

    /// Route a response to its waiter. Unknown ids are logged and dropped.
    fn deliver(&self, id: u64, outcome: Result<Value, RpcError>) {
        let waiter = self.table().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // The waiter may have just given up; nothing to do then.
                let _ = tx.send(outcome.map_err(ChannelError::from));
            }
            None => {
                tracing::warn!(
                    channel = %self.label,
                    request_id = id,
                    "Response for unknown or expired request, dropping",
                );
            }
        }
    }

    /// Close the channel. Returns `false` if it was already closed.
    fn close(&self, reason: CloseReason) -> bool {
        let error = reason.to_error();
        let waiters = {
            let mut table = self.table();
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(error.clone());
            std::mem::take(&mut table.waiters)
        };

        let failed = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(error.clone()));
        }

        self.permits.close();
        self.shutdown.cancel();

        match &reason {
            CloseReason::Local(_) | CloseReason::Eof => {
                tracing::debug!(channel = %self.label, %reason, failed, "Channel closed");
            }
            _ => {
                tracing::warn!(channel = %self.label, %reason, failed, "Channel closed");
            }
        }

        let _ = self.events.send(ChannelEvent::Closed { reason });
        true
    }
}

/// Removes a pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.table().waiters.remove(&self.id);
    }
}

/// Request/response transport over a pair of byte streams.
pub struct Channel {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
}

impl Channel {
    /// Start the reader and writer tasks over `reader` (worker stdout) and
    /// `writer` (worker stdin).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<R, W>(
        reader: R,
        writer: W,
        label: impl Into<String>,
        config: &ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let max_in_flight = config.max_in_flight.max(1);

        let shared = Arc::new(Shared {
            label: label.into(),
            pending: Mutex::new(PendingTable::default()),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            shutdown: CancellationToken::new(),
            events: events_tx,
        });

        let read = FramedRead::new(
            reader,
            LinesCodec::new_with_max_length(config.max_frame_bytes),
        );
        let write = FramedWrite::new(writer, LinesCodec::new());

        tokio::spawn(read_loop(Arc::clone(&shared), read, config.max_frame_bytes));
        tokio::spawn(write_loop(Arc::clone(&shared), write, outbound_rx));

        let channel = Self {
            shared,
            outbound: outbound_tx,
            next_id: AtomicU64::new(1),
        };
        (channel, events_rx)
    }

    /// Send a request and wait for its response.
    ///
    /// Waiting for a free in-flight slot and waiting for the response share
    /// the same `timeout`.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let deadline = Instant::now() + timeout;
        let acquire = Arc::clone(&self.shared.permits).acquire_owned();
        let permit = match tokio::time::timeout_at(deadline, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.shared.closed_error()),
            Err(_) => {
                return Err(ChannelError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        };
        self.request(method, params, timeout, deadline, permit).await
    }

    /// Like [`send`](Self::send) but fails immediately with
    /// [`ChannelError::Backpressure`] when the in-flight table is full.
    pub async fn try_send(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let deadline = Instant::now() + timeout;
        let permit = match Arc::clone(&self.shared.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(ChannelError::Backpressure(self.shared.max_in_flight))
            }
            Err(TryAcquireError::Closed) => return Err(self.shared.closed_error()),
        };
        self.request(method, params, timeout, deadline, permit).await
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        deadline: Instant,
        _permit: OwnedSemaphorePermit,
    ) -> Result<Value, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.shared.table();
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            table.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = RequestFrame {
            id,
            method: method.to_string(),
            params,
            timeout_ms: remaining.as_millis() as u64,
        };
        let line = serde_json::to_string(&frame).map_err(|e| ChannelError::Encode(e.to_string()))?;
        if self.outbound.send(line).is_err() {
            return Err(self.shared.closed_error());
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.shared.closed_error()),
            Err(_) => {
                tracing::debug!(
                    channel = %self.shared.label,
                    request_id = id,
                    method,
                    "Request timed out",
                );
                Err(ChannelError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }
        let line = serde_json::to_string(&NotificationFrame::new(method, params))
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.outbound
            .send(line)
            .map_err(|_| self.shared.closed_error())
    }

    /// Close the channel, failing every pending request.
    pub fn close(&self) {
        self.shared
            .close(CloseReason::Local("closed by coordinator".into()));
    }

    /// Close the channel with a specific reason.
    ///
    /// Used by the supervisor when it learns about a failure the channel
    /// cannot see itself (the process exited, heartbeats stopped).
    pub fn close_with(&self, reason: CloseReason) {
        self.shared.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.table().waiters.len()
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared
            .close(CloseReason::Local("channel dropped".into()));
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut lines: FramedRead<R, LinesCodec>, max_frame: usize)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let reason = loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            next = lines.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                break CloseReason::Protocol(format!("frame exceeds {max_frame} bytes"));
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                break CloseReason::Protocol(format!("frame is not valid UTF-8: {e}"));
            }
            Some(Err(LinesCodecError::Io(e))) => break CloseReason::Io(e.to_string()),
            None => break CloseReason::Eof,
        };

        if line.trim().is_empty() {
            continue;
        }

        match parse_worker_frame(&line) {
            Ok(WorkerFrame::Response { id, outcome }) => shared.deliver(id, outcome),
            Ok(WorkerFrame::Notification(n)) => {
                let _ = shared.events.send(ChannelEvent::Notification(n));
            }
            Ok(WorkerFrame::Heartbeat(hb)) => {
                let _ = shared.events.send(ChannelEvent::Heartbeat(hb));
            }
            Err(e) => break CloseReason::Protocol(e.to_string()),
        }
    };

    shared.close(reason);
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<W, LinesCodec>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let line = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        if let Err(e) = sink.send(line).await {
            shared.close(CloseReason::Io(e.to_string()));
            break;
        }
    }

    // Flush whatever is already queued (a final `shutdown` notification)
    // before the pipe is dropped.
    while let Ok(line) = outbound.try_recv() {
        if sink.send(line).await.is_err() {
            break;
        }
    }
    let _ = SinkExt::<String>::close(&mut sink).await;
}
