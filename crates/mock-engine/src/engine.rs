//! Protocol loop of the mock engine.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lingosub_core::types::TaskId;
use lingosub_sidecar::messages::{
    parse_coordinator_frame, CancelParams, Capabilities, CoordinatorFrame, HealthReport,
    Heartbeat, HeartbeatStatus, NotificationFrame, ProgressParams, RequestFrame, ResponseFrame,
    TranscribeParams, METHOD_CANCEL, METHOD_GET_CAPABILITIES, METHOD_GET_METRICS,
    METHOD_HEALTH_CHECK, METHOD_TRANSCRIBE, NOTIFY_PROGRESS, NOTIFY_SHUTDOWN,
};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::config::{HealthAnswer, MockEngineConfig};

const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A `shutdown` notification arrived or the cancel token fired.
    Shutdown,
    /// The coordinator closed our input.
    InputClosed,
    /// A crash was simulated (`crash_after`). Output is dropped unflushed.
    Crashed,
}

/// Serialises frames onto the writer task.
#[derive(Clone)]
struct Outbox(mpsc::UnboundedSender<String>);

impl Outbox {
    fn send<T: Serialize>(&self, frame: &T) {
        match serde_json::to_string(frame) {
            Ok(line) => {
                let _ = self.0.send(line);
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode frame"),
        }
    }
}

struct Engine {
    config: MockEngineConfig,
    out: Outbox,
    running: HashMap<TaskId, CancellationToken>,
    tasks: JoinSet<TaskId>,
    accepted: u32,
    finished: u64,
    started: Instant,
}

/// Run the engine until shutdown, input EOF or a simulated crash.
pub async fn serve<R, W>(
    config: MockEngineConfig,
    input: R,
    output: W,
    cancel: CancellationToken,
) -> ExitReason
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(
        FramedWrite::new(output, LinesCodec::new()),
        out_rx,
    ));
    let mut lines = FramedRead::new(input, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let mut heartbeat = config.heartbeat_interval.map(tokio::time::interval);

    tracing::info!(engine = %config.engine, slots = config.slots, "Mock engine ready");

    let mut engine = Engine {
        config,
        out: Outbox(out_tx),
        running: HashMap::new(),
        tasks: JoinSet::new(),
        accepted: 0,
        finished: 0,
        started: Instant::now(),
    };

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break ExitReason::Shutdown,
            Some(done) = engine.tasks.join_next(), if !engine.tasks.is_empty() => {
                if let Ok(task_id) = done {
                    engine.running.remove(&task_id);
                    engine.finished += 1;
                }
            }
            _ = next_tick(&mut heartbeat) => engine.heartbeat(),
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    if let Some(reason) = engine.handle_line(&line) {
                        break reason;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(max = MAX_FRAME_BYTES, "Dropping oversized frame");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::warn!(error = %e, "Input stream failed");
                    break ExitReason::InputClosed;
                }
                None => break ExitReason::InputClosed,
            },
        }
    };

    tracing::info!(reason = ?reason, in_flight = engine.running.len(), "Mock engine exiting");

    if reason == ExitReason::Crashed {
        writer.abort();
    }
    // Dropping the engine aborts in-flight work and the last outbox sender,
    // which lets the writer drain and close.
    drop(engine);
    let _ = writer.await;
    reason
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_frames<W>(mut sink: FramedWrite<W, LinesCodec>, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            tracing::warn!(error = %e, "Output stream failed");
            return;
        }
    }
    let _ = SinkExt::<String>::close(&mut sink).await;
}

impl Engine {
    fn handle_line(&mut self, line: &str) -> Option<ExitReason> {
        if line.trim().is_empty() {
            return None;
        }
        match parse_coordinator_frame(line) {
            Ok(CoordinatorFrame::Request(req)) => self.handle_request(req),
            Ok(CoordinatorFrame::Notification(n)) if n.method == NOTIFY_SHUTDOWN => {
                tracing::info!("Shutdown requested");
                Some(ExitReason::Shutdown)
            }
            Ok(CoordinatorFrame::Notification(n)) => {
                tracing::debug!(method = %n.method, "Ignoring notification");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable frame");
                None
            }
        }
    }

    fn handle_request(&mut self, req: RequestFrame) -> Option<ExitReason> {
        match req.method.as_str() {
            METHOD_GET_CAPABILITIES => {
                let caps = Capabilities {
                    engines: vec![self.config.engine.as_str().to_string()],
                    slots: Some(self.config.slots),
                };
                self.out.send(&ResponseFrame::success(req.id, json!(caps)));
            }
            METHOD_TRANSCRIBE => return self.start_transcription(req),
            METHOD_HEALTH_CHECK => {
                let status = match self.config.health {
                    HealthAnswer::Healthy => HealthReport::HEALTHY,
                    HealthAnswer::Unhealthy => "unhealthy",
                    HealthAnswer::Silent => {
                        tracing::debug!("Ignoring health check");
                        return None;
                    }
                };
                let report = HealthReport {
                    status: status.into(),
                    details: json!({
                        "engine_id": self.config.engine.as_str(),
                        "uptime_secs": self.started.elapsed().as_secs_f64(),
                    }),
                };
                self.out.send(&ResponseFrame::success(req.id, json!(report)));
            }
            METHOD_GET_METRICS => {
                let metrics = json!({
                    "accepted": self.accepted,
                    "active": self.running.len(),
                    "finished": self.finished,
                    "slots": self.config.slots,
                });
                self.out.send(&ResponseFrame::success(req.id, metrics));
            }
            METHOD_CANCEL => match serde_json::from_value::<CancelParams>(req.params) {
                Ok(params) => {
                    let cancelled = match self.running.get(&params.task_id) {
                        Some(token) => {
                            token.cancel();
                            true
                        }
                        None => false,
                    };
                    tracing::info!(task_id = %params.task_id, cancelled, "Cancel requested");
                    self.out.send(&ResponseFrame::success(
                        req.id,
                        json!({ "cancelled": cancelled }),
                    ));
                }
                Err(e) => self.invalid(req.id, e.to_string()),
            },
            other => self.invalid(req.id, format!("unknown method '{other}'")),
        }
        None
    }

    fn start_transcription(&mut self, req: RequestFrame) -> Option<ExitReason> {
        let params: TranscribeParams = match serde_json::from_value(req.params) {
            Ok(params) => params,
            Err(e) => {
                self.invalid(req.id, e.to_string());
                return None;
            }
        };

        if self.config.crash_after == Some(self.accepted) {
            tracing::error!(accepted = self.accepted, "Simulating engine crash");
            return Some(ExitReason::Crashed);
        }
        self.accepted += 1;

        if self.running.len() >= self.config.slots as usize {
            self.out.send(&ResponseFrame::failure(
                req.id,
                "NO_CAPACITY",
                format!("all {} slots busy", self.config.slots),
            ));
            return None;
        }

        let token = CancellationToken::new();
        self.running.insert(params.task_id, token.clone());
        tracing::info!(task_id = %params.task_id, timeout_ms = req.timeout_ms, "Transcribing");

        let job = Transcription {
            request_id: req.id,
            task_id: params.task_id,
            text: self.config.text.clone().unwrap_or_else(|| {
                params.payload["text"].as_str().unwrap_or_default().to_string()
            }),
            confidence: self.config.confidence,
            engine: self.config.engine.as_str(),
            delay: self.config.delay,
            fail: self.config.fail_transcriptions,
            progress: self.config.report_progress,
        };
        self.tasks.spawn(job.run(self.out.clone(), token));
        None
    }

    fn invalid(&self, id: u64, message: String) {
        self.out
            .send(&ResponseFrame::failure(id, "INVALID_PARAMS", message));
    }

    fn heartbeat(&self) {
        let load = self.running.len() as u32;
        let status = if load >= self.config.slots {
            HeartbeatStatus::Busy
        } else {
            HeartbeatStatus::Alive
        };
        self.out.send(&Heartbeat {
            engine_id: self.config.engine.as_str().to_string(),
            status,
            load,
            queue_size: 0,
        });
    }
}

struct Transcription {
    request_id: u64,
    task_id: TaskId,
    text: String,
    confidence: f64,
    engine: &'static str,
    delay: Duration,
    fail: bool,
    progress: bool,
}

impl Transcription {
    async fn run(self, out: Outbox, cancel: CancellationToken) -> TaskId {
        let half = self.delay / 2;
        let finished = sleep_unless_cancelled(half, &cancel).await && {
            if self.progress {
                let params = ProgressParams {
                    task_id: self.task_id,
                    percent: 50.0,
                };
                out.send(&NotificationFrame::new(NOTIFY_PROGRESS, json!(params)));
            }
            sleep_unless_cancelled(self.delay - half, &cancel).await
        };

        let response = if !finished {
            tracing::info!(task_id = %self.task_id, "Transcription cancelled");
            ResponseFrame::failure(self.request_id, "TASK_CANCELLED", "cancelled by coordinator")
        } else if self.fail {
            ResponseFrame::failure(self.request_id, "TASK_FAILED", "simulated engine failure")
        } else {
            ResponseFrame::success(
                self.request_id,
                json!({
                    "text": self.text,
                    "confidence": self.confidence,
                    "engine": self.engine,
                }),
            )
        };
        out.send(&response);
        self.task_id
    }
}

/// Returns `false` if cancelled before `duration` elapsed.
async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
