#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lingosub_core::backoff::BackoffConfig;
use lingosub_core::capability::EngineCapability;
use lingosub_coordinator::health::HealthConfig;
use lingosub_coordinator::scheduler::SchedulerConfig;
use lingosub_coordinator::{Coordinator, CoordinatorConfig, EngineSpec};
use lingosub_events::{CoordinatorEvent, EventEnvelope};
use lingosub_mock_engine::{serve, ExitReason, MockEngineConfig};
use lingosub_sidecar::{
    ExitInfo, LaunchError, LaunchedWorker, Launcher, ProcessHandle, WorkerCommand,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs `lingosub_mock_engine::serve` in-process over `tokio::io::duplex`.
///
/// The engine comes from the command's program name (`"whisper"`,
/// `"funasr"`, ...). Per-worker behaviour is set by supervisor name:
/// [`MockLauncher::set`] for every launch, [`MockLauncher::push_next`] for
/// one launch.
pub struct MockLauncher {
    configs: Mutex<HashMap<String, MockEngineConfig>>,
    next: Mutex<HashMap<String, VecDeque<MockEngineConfig>>>,
    refused: Mutex<HashSet<String>>,
    launches: AtomicU32,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            configs: Mutex::new(HashMap::new()),
            next: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
            launches: AtomicU32::new(0),
        })
    }

    pub fn set(&self, worker: &str, config: MockEngineConfig) {
        self.configs.lock().unwrap().insert(worker.into(), config);
    }

    pub fn push_next(&self, worker: &str, config: MockEngineConfig) {
        self.next
            .lock()
            .unwrap()
            .entry(worker.into())
            .or_default()
            .push_back(config);
    }

    /// Make every further launch of `worker` fail.
    pub fn refuse(&self, worker: &str) {
        self.refused.lock().unwrap().insert(worker.into());
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    fn config_for(&self, command: &WorkerCommand, label: &str) -> MockEngineConfig {
        if let Some(config) = self
            .next
            .lock()
            .unwrap()
            .get_mut(label)
            .and_then(VecDeque::pop_front)
        {
            return config;
        }
        if let Some(config) = self.configs.lock().unwrap().get(label) {
            return config.clone();
        }
        let engine = command
            .program
            .to_str()
            .and_then(|p| p.parse::<EngineCapability>().ok())
            .unwrap_or(EngineCapability::Test);
        engine_config(engine)
    }
}

/// A well-behaved engine with fast heartbeats.
pub fn engine_config(engine: EngineCapability) -> MockEngineConfig {
    MockEngineConfig {
        engine,
        slots: 1,
        delay: Duration::from_millis(20),
        heartbeat_interval: Some(Duration::from_millis(50)),
        ..MockEngineConfig::default()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(
        &self,
        command: &WorkerCommand,
        label: &str,
    ) -> Result<LaunchedWorker, LaunchError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().unwrap().contains(label) {
            return Err(LaunchError::Refused(format!("{label} is refused")));
        }

        let config = self.config_for(command, label);
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let task = tokio::spawn(serve(config, their_read, their_write, CancellationToken::new()));

        Ok(LaunchedWorker {
            pid: Some(20_000 + n),
            output: Box::new(our_read),
            input: Box::new(our_write),
            process: Box::new(InProcess {
                task: Some(task),
                exit: None,
            }),
        })
    }
}

struct InProcess {
    task: Option<JoinHandle<ExitReason>>,
    exit: Option<ExitInfo>,
}

#[async_trait]
impl ProcessHandle for InProcess {
    async fn wait(&mut self) -> ExitInfo {
        if let Some(task) = self.task.as_mut() {
            let exit = match task.await {
                Ok(ExitReason::Crashed) => ExitInfo {
                    code: Some(3),
                    description: "exit status: 3".into(),
                },
                Ok(_) => ExitInfo {
                    code: Some(0),
                    description: "exit status: 0".into(),
                },
                Err(_) => ExitInfo {
                    code: None,
                    description: "killed".into(),
                },
            };
            self.task = None;
            self.exit = Some(exit);
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

pub fn spec(engine: EngineCapability, instances: u32, slots: u32) -> EngineSpec {
    EngineSpec {
        engine,
        command: engine.as_str().into(),
        args: Vec::new(),
        env: HashMap::new(),
        working_directory: None,
        instances,
        slots,
    }
}

/// Configuration with short timeouts suitable for tests.
pub fn config(engines: Vec<EngineSpec>) -> CoordinatorConfig {
    CoordinatorConfig {
        engines,
        scheduler: SchedulerConfig {
            rpc_timeout: Duration::from_secs(5),
            task_timeout: Duration::from_secs(10),
            max_retries: 3,
            aging_threshold: Duration::from_secs(60),
            cancel_ack_timeout: Duration::from_millis(500),
            ..SchedulerConfig::default()
        },
        health: HealthConfig {
            heartbeat_interval: Duration::from_millis(100),
            miss_factor: 3,
            // Enabled by the tests that exercise it.
            check_interval: None,
            check_timeout: Duration::from_millis(200),
        },
        aggregation_timeout: Duration::from_secs(5),
        restart: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            max_attempts: 3,
        },
        stop_grace: Duration::from_secs(1),
        ..CoordinatorConfig::default()
    }
}

pub async fn start(config: CoordinatorConfig, launcher: Arc<MockLauncher>) -> Coordinator {
    let coordinator = Coordinator::new(config, launcher);
    let configured = coordinator.pool().supervisors().len();
    assert_eq!(coordinator.start_workers().await, configured, "all workers should start");
    coordinator
}

/// Collect every event published so far.
pub fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<CoordinatorEvent> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope.event);
    }
    out
}

/// Wait for the first event matching `pred`.
pub async fn next_matching<F>(rx: &mut broadcast::Receiver<EventEnvelope>, mut pred: F) -> CoordinatorEvent
where
    F: FnMut(&CoordinatorEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(envelope) if pred(&envelope.event) => return envelope.event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("expected event within 5s")
}

/// Wait (bounded) until `check` holds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
