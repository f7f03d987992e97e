#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lingosub_core::backoff::BackoffConfig;
use lingosub_core::capability::EngineCapability;
use lingosub_events::{CoordinatorEvent, EventBus};
use lingosub_sidecar::messages::{
    parse_coordinator_frame, CoordinatorFrame, ResponseFrame, TranscribeParams,
};
use lingosub_sidecar::{
    ExitInfo, HealthSignal, LaunchError, LaunchedWorker, Launcher, ProcessHandle,
    SupervisorConfig, WorkerCommand, WorkerSupervisor,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

/// How a scripted in-memory worker behaves.
#[derive(Debug, Clone)]
pub struct Script {
    pub engines: Vec<String>,
    pub slots: Option<u32>,
    pub answer_handshake: bool,
    pub transcribe_delay: Duration,
    /// Exit as soon as a `transcribe` request arrives.
    pub crash_on_transcribe: bool,
    pub ignore_shutdown: bool,
    pub ack_cancel: bool,
    pub send_progress: bool,
    pub heartbeat: Option<Duration>,
    /// Status answered to `health_check`; `None` never answers.
    pub health_status: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            engines: vec!["whisper".into()],
            slots: None,
            answer_handshake: true,
            transcribe_delay: Duration::ZERO,
            crash_on_transcribe: false,
            ignore_shutdown: false,
            ack_cancel: true,
            send_progress: false,
            heartbeat: None,
            health_status: Some("healthy".into()),
        }
    }
}

/// Launches scripted workers over `tokio::io::duplex` pipes.
pub struct ScriptedLauncher {
    script: Mutex<Script>,
    failures_left: AtomicU32,
    launches: AtomicU32,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            failures_left: AtomicU32::new(0),
            launches: AtomicU32::new(0),
        })
    }

    /// Make the next `n` launches fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(
        &self,
        _command: &WorkerCommand,
        _label: &str,
    ) -> Result<LaunchedWorker, LaunchError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LaunchError::Refused("scripted launch failure".into()));
        }

        let script = self.script.lock().unwrap().clone();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let task = tokio::spawn(run_script(script, theirs));

        Ok(LaunchedWorker {
            pid: Some(10_000 + n),
            output: Box::new(our_read),
            input: Box::new(our_write),
            process: Box::new(ScriptedProcess {
                task: Some(task),
                exit: None,
            }),
        })
    }
}

struct ScriptedProcess {
    task: Option<JoinHandle<()>>,
    exit: Option<ExitInfo>,
}

#[async_trait]
impl ProcessHandle for ScriptedProcess {
    async fn wait(&mut self) -> ExitInfo {
        if let Some(task) = self.task.as_mut() {
            let result = task.await;
            self.task = None;
            self.exit = Some(match result {
                Ok(()) => ExitInfo {
                    code: Some(0),
                    description: "exit status: 0".into(),
                },
                Err(_) => ExitInfo {
                    code: None,
                    description: "killed".into(),
                },
            });
        }
        self.exit.clone().unwrap_or(ExitInfo {
            code: None,
            description: "unknown".into(),
        })
    }

    async fn kill(&mut self) {
        if let Some(task) = self.task.as_ref() {
            task.abort();
        }
    }
}

type Out = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

async fn write_line(out: &Out, value: serde_json::Value) {
    let mut line = value.to_string();
    line.push('\n');
    let _ = out.lock().await.write_all(line.as_bytes()).await;
}

async fn run_script(script: Script, pipe: DuplexStream) {
    let (read, write) = tokio::io::split(pipe);
    let out: Out = Arc::new(tokio::sync::Mutex::new(write));
    let mut lines = BufReader::new(read).lines();

    let heartbeat = script.heartbeat.map(|every| {
        let out = Arc::clone(&out);
        let engine = script.engines.first().cloned().unwrap_or_default();
        tokio::spawn(async move {
            loop {
                write_line(
                    &out,
                    json!({"engine_id": engine, "status": "alive", "load": 0, "queue_size": 3}),
                )
                .await;
                tokio::time::sleep(every).await;
            }
        })
    });

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(frame) = parse_coordinator_frame(&line) else {
            continue;
        };
        match frame {
            CoordinatorFrame::Request(req) => match req.method.as_str() {
                "get_capabilities" => {
                    if script.answer_handshake {
                        let caps = json!({"engines": script.engines, "slots": script.slots});
                        write_line(&out, json!(ResponseFrame::success(req.id, caps))).await;
                    }
                }
                "transcribe" => {
                    if script.crash_on_transcribe {
                        break;
                    }
                    let params: TranscribeParams = serde_json::from_value(req.params).unwrap();
                    let out = Arc::clone(&out);
                    let script = script.clone();
                    tokio::spawn(async move {
                        if script.send_progress {
                            write_line(
                                &out,
                                json!({"method": "progress", "params": {"task_id": params.task_id, "percent": 50.0}}),
                            )
                            .await;
                        }
                        tokio::time::sleep(script.transcribe_delay).await;
                        let text = params.payload["text"].as_str().unwrap_or("ok").to_string();
                        let result = json!({"text": text, "confidence": 0.9});
                        write_line(&out, json!(ResponseFrame::success(req.id, result))).await;
                    });
                }
                "health_check" => {
                    if let Some(status) = &script.health_status {
                        let report = json!({"status": status, "details": {"checks": 1}});
                        write_line(&out, json!(ResponseFrame::success(req.id, report))).await;
                    }
                }
                "get_metrics" => {
                    let metrics = json!({"requests": 4, "errors": 1});
                    write_line(&out, json!(ResponseFrame::success(req.id, metrics))).await;
                }
                "cancel" => {
                    if script.ack_cancel {
                        write_line(&out, json!(ResponseFrame::success(req.id, json!({"cancelled": true}))))
                            .await;
                    }
                }
                other => {
                    let resp = ResponseFrame::failure(req.id, "INVALID_PARAMS", format!("unknown method {other}"));
                    write_line(&out, json!(resp)).await;
                }
            },
            CoordinatorFrame::Notification(n) => {
                if n.method == "shutdown" && !script.ignore_shutdown {
                    break;
                }
            }
        }
    }

    if let Some(hb) = heartbeat {
        hb.abort();
    }
}

/// A supervisor wired to fresh bus/health/availability plumbing.
pub struct Harness {
    pub supervisor: Arc<WorkerSupervisor>,
    pub launcher: Arc<ScriptedLauncher>,
    pub events: broadcast::Receiver<lingosub_events::EventEnvelope>,
    pub health: mpsc::UnboundedReceiver<HealthSignal>,
    pub availability: Arc<Notify>,
}

pub fn fast_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
        max_attempts,
    }
}

pub fn harness(script: Script, slots: u32) -> Harness {
    let launcher = ScriptedLauncher::new(script);
    let bus = Arc::new(EventBus::default());
    let events = bus.subscribe();
    let (health_tx, health) = mpsc::unbounded_channel();
    let availability = Arc::new(Notify::new());

    let mut config = SupervisorConfig::new(
        "whisper-0",
        EngineCapability::Whisper,
        WorkerCommand::new("scripted"),
    );
    config.slots = slots;
    config.handshake_timeout = Duration::from_millis(200);
    config.restart = fast_backoff(3);

    let supervisor = WorkerSupervisor::new(
        config,
        launcher.clone(),
        bus,
        health_tx,
        Arc::clone(&availability),
    );
    Harness {
        supervisor,
        launcher,
        events,
        health,
        availability,
    }
}

/// Collect every event published so far.
pub fn drain(rx: &mut broadcast::Receiver<lingosub_events::EventEnvelope>) -> Vec<CoordinatorEvent> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope.event);
    }
    out
}

/// Wait (bounded) until `check` holds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
