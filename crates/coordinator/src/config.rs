//! Coordinator configuration loaded from environment variables and an
//! engines file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use lingosub_core::backoff::BackoffConfig;
use lingosub_core::capability::EngineCapability;
use lingosub_core::error::ErrorCode;
use lingosub_core::similarity::ScoringPolicy;
use lingosub_sidecar::{ChannelConfig, SupervisorConfig, WorkerCommand};
use serde::Deserialize;

use crate::aggregator::DEFAULT_RETAINED_COMPARISONS;
use crate::health::HealthConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read engines file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid engines file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidParams
    }
}

fn one() -> u32 {
    1
}

/// One entry of the engines file: how to launch `instances` identical
/// workers for an engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineSpec {
    pub engine: EngineCapability,
    /// Program to execute.
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "one")]
    pub instances: u32,
    /// Concurrent tasks per worker.
    #[serde(default = "one")]
    pub slots: u32,
}

impl EngineSpec {
    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            working_directory: self.working_directory.clone(),
        }
    }
}

/// Parse the JSON list of [`EngineSpec`]s.
pub fn parse_engines(json: &str, path: &Path) -> Result<Vec<EngineSpec>, ConfigError> {
    serde_json::from_str(json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Everything the coordinator needs to run.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub engines: Vec<EngineSpec>,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    /// How long a comparison waits for all engines before going partial.
    pub aggregation_timeout: Duration,
    /// Frozen comparisons kept for `comparison`; the oldest are forgotten.
    pub retained_comparisons: usize,
    pub scoring: ScoringPolicy,
    pub restart: BackoffConfig,
    pub channel: ChannelConfig,
    /// Grace period for workers to exit after `shutdown`.
    pub stop_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            engines: Vec::new(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            aggregation_timeout: Duration::from_secs(600),
            retained_comparisons: DEFAULT_RETAINED_COMPARISONS,
            scoring: ScoringPolicy::default(),
            restart: BackoffConfig::default(),
            channel: ChannelConfig::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default          |
    /// |----------------------------|------------------|
    /// | `ENGINES_CONFIG`           | none (no workers)|
    /// | `RPC_TIMEOUT_MS`           | `300000`         |
    /// | `TASK_TIMEOUT_MS`          | `1800000`        |
    /// | `MAX_RETRIES`              | `3`              |
    /// | `AGING_THRESHOLD_MS`       | `60000`          |
    /// | `AGGREGATION_TIMEOUT_MS`   | `600000`         |
    /// | `HEARTBEAT_INTERVAL_MS`    | `5000`           |
    /// | `HEARTBEAT_MISS_FACTOR`    | `3`              |
    /// | `HEALTH_CHECK_INTERVAL_MS` | `30000` (0 = off)|
    /// | `HEALTH_CHECK_TIMEOUT_MS`  | `5000`           |
    /// | `RESTART_MAX_ATTEMPTS`     | `5`              |
    /// | `RESTART_INITIAL_DELAY_MS` | `1000`           |
    /// | `RESTART_MAX_DELAY_MS`     | `30000`          |
    /// | `MAX_IN_FLIGHT`            | `16`             |
    /// | `MAX_FRAME_BYTES`          | `8388608`        |
    /// | `STOP_GRACE_MS`            | `5000`           |
    /// | `CANCEL_ACK_TIMEOUT_MS`    | `2000`           |
    /// | `RETAINED_TASKS`           | `10000`          |
    /// | `RETAINED_COMPARISONS`     | `1000`           |
    ///
    /// The result is [`validate`](Self::validate)d.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let engines = match std::env::var("ENGINES_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let json = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                parse_engines(&json, &path)?
            }
            Err(_) => Vec::new(),
        };

        let scheduler = SchedulerConfig {
            rpc_timeout: env_millis("RPC_TIMEOUT_MS", defaults.scheduler.rpc_timeout)?,
            task_timeout: env_millis("TASK_TIMEOUT_MS", defaults.scheduler.task_timeout)?,
            max_retries: env_or("MAX_RETRIES", defaults.scheduler.max_retries)?,
            aging_threshold: env_millis("AGING_THRESHOLD_MS", defaults.scheduler.aging_threshold)?,
            cancel_ack_timeout: env_millis(
                "CANCEL_ACK_TIMEOUT_MS",
                defaults.scheduler.cancel_ack_timeout,
            )?,
            retained_tasks: env_or("RETAINED_TASKS", defaults.scheduler.retained_tasks)?,
        };

        let health = HealthConfig {
            heartbeat_interval: env_millis(
                "HEARTBEAT_INTERVAL_MS",
                defaults.health.heartbeat_interval,
            )?,
            miss_factor: env_or("HEARTBEAT_MISS_FACTOR", defaults.health.miss_factor)?,
            check_interval: match env_opt::<u64>("HEALTH_CHECK_INTERVAL_MS")? {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.health.check_interval,
            },
            check_timeout: env_millis("HEALTH_CHECK_TIMEOUT_MS", defaults.health.check_timeout)?,
        };

        let restart = BackoffConfig {
            initial_delay: env_millis("RESTART_INITIAL_DELAY_MS", defaults.restart.initial_delay)?,
            max_delay: env_millis("RESTART_MAX_DELAY_MS", defaults.restart.max_delay)?,
            max_attempts: env_or("RESTART_MAX_ATTEMPTS", defaults.restart.max_attempts)?,
            ..defaults.restart
        };

        let channel = ChannelConfig {
            max_in_flight: env_or("MAX_IN_FLIGHT", defaults.channel.max_in_flight)?,
            max_frame_bytes: env_or("MAX_FRAME_BYTES", defaults.channel.max_frame_bytes)?,
        };

        let config = Self {
            engines,
            scheduler,
            health,
            aggregation_timeout: env_millis("AGGREGATION_TIMEOUT_MS", defaults.aggregation_timeout)?,
            retained_comparisons: env_or("RETAINED_COMPARISONS", defaults.retained_comparisons)?,
            scoring: defaults.scoring,
            restart,
            channel,
            stop_grace: env_millis("STOP_GRACE_MS", defaults.stop_grace)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(key: &'static str, value: u128) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                    reason: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        positive("HEARTBEAT_INTERVAL_MS", self.health.heartbeat_interval.as_millis())?;
        positive("HEARTBEAT_MISS_FACTOR", self.health.miss_factor.into())?;
        positive("HEALTH_CHECK_TIMEOUT_MS", self.health.check_timeout.as_millis())?;
        positive("MAX_IN_FLIGHT", self.channel.max_in_flight as u128)?;
        positive("MAX_FRAME_BYTES", self.channel.max_frame_bytes as u128)?;
        positive("RETAINED_TASKS", self.scheduler.retained_tasks as u128)?;
        positive("RETAINED_COMPARISONS", self.retained_comparisons as u128)?;
        Ok(())
    }

    /// One supervisor configuration per worker instance, named
    /// `<engine>-<n>` with `n` counted per engine.
    pub fn supervisor_configs(&self) -> Vec<SupervisorConfig> {
        let mut counters: HashMap<EngineCapability, u32> = HashMap::new();
        let mut configs = Vec::new();
        for spec in &self.engines {
            for _ in 0..spec.instances {
                let n = counters.entry(spec.engine).or_default();
                let mut config = SupervisorConfig::new(
                    format!("{}-{}", spec.engine, n),
                    spec.engine,
                    spec.worker_command(),
                );
                *n += 1;
                config.slots = spec.slots.max(1);
                config.channel = self.channel.clone();
                config.restart = self.restart.clone();
                configs.push(config);
            }
        }
        configs
    }

    /// Engines that at least one configured worker provides.
    pub fn served_engines(&self) -> HashSet<EngineCapability> {
        self.engines
            .iter()
            .filter(|spec| spec.instances > 0)
            .map(|spec| spec.engine)
            .collect()
    }
}

fn env_opt<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        },
        Err(_) => Ok(None),
    }
}

fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_opt::<u64>(key)?.map_or(default, Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engines_file_defaults_instances_and_slots() {
        let json = r#"[
            {"engine": "whisper", "command": "/opt/engines/whisper", "args": ["--model", "base"]},
            {"engine": "funasr", "command": "funasr-worker", "instances": 2, "slots": 4,
             "env": {"MODEL_DIR": "/models"}}
        ]"#;
        let engines = parse_engines(json, Path::new("engines.json")).unwrap();
        assert_eq!(engines.len(), 2);
        assert_eq!(engines[0].engine, EngineCapability::Whisper);
        assert_eq!(engines[0].instances, 1);
        assert_eq!(engines[0].slots, 1);
        assert_eq!(engines[0].worker_command().args, vec!["--model", "base"]);
        assert_eq!(engines[1].instances, 2);
        assert_eq!(engines[1].env["MODEL_DIR"], "/models");
    }

    #[test]
    fn unknown_engine_is_a_parse_error() {
        let json = r#"[{"engine": "kaldi", "command": "kaldi"}]"#;
        let err = parse_engines(json, Path::new("engines.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("engines.json"));
    }

    #[test]
    fn supervisor_names_are_counted_per_engine() {
        let config = CoordinatorConfig {
            engines: vec![
                EngineSpec {
                    engine: EngineCapability::Whisper,
                    command: "whisper".into(),
                    args: Vec::new(),
                    env: HashMap::new(),
                    working_directory: None,
                    instances: 2,
                    slots: 3,
                },
                EngineSpec {
                    engine: EngineCapability::FunAsr,
                    command: "funasr".into(),
                    args: Vec::new(),
                    env: HashMap::new(),
                    working_directory: None,
                    instances: 1,
                    slots: 0,
                },
            ],
            ..CoordinatorConfig::default()
        };

        let configs = config.supervisor_configs();
        let names: Vec<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["whisper-0", "whisper-1", "funasr-0"]);
        assert_eq!(configs[0].slots, 3);
        // Zero slots is clamped to one.
        assert_eq!(configs[2].slots, 1);
        assert_eq!(config.served_engines().len(), 2);
    }

    #[test]
    fn env_millis_rejects_garbage() {
        std::env::set_var("LINGOSUB_TEST_BAD_MILLIS", "soon");
        let err = env_millis("LINGOSUB_TEST_BAD_MILLIS", Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("LINGOSUB_TEST_BAD_MILLIS"));
        std::env::remove_var("LINGOSUB_TEST_BAD_MILLIS");
    }

    #[test]
    fn zero_heartbeat_interval_from_env_is_rejected() {
        std::env::set_var("HEARTBEAT_INTERVAL_MS", "0");
        let result = CoordinatorConfig::from_env();
        std::env::remove_var("HEARTBEAT_INTERVAL_MS");

        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "HEARTBEAT_INTERVAL_MS", .. }));
        assert_eq!(err.code(), ErrorCode::InvalidParams);
    }

    #[test]
    fn zero_values_fail_validation() {
        assert!(CoordinatorConfig::default().validate().is_ok());

        let cases: [(&str, fn(&mut CoordinatorConfig)); 7] = [
            ("HEARTBEAT_INTERVAL_MS", |c| c.health.heartbeat_interval = Duration::ZERO),
            ("HEARTBEAT_MISS_FACTOR", |c| c.health.miss_factor = 0),
            ("HEALTH_CHECK_TIMEOUT_MS", |c| c.health.check_timeout = Duration::ZERO),
            ("MAX_IN_FLIGHT", |c| c.channel.max_in_flight = 0),
            ("MAX_FRAME_BYTES", |c| c.channel.max_frame_bytes = 0),
            ("RETAINED_TASKS", |c| c.scheduler.retained_tasks = 0),
            ("RETAINED_COMPARISONS", |c| c.retained_comparisons = 0),
        ];
        for (expected, zero) in cases {
            let mut config = CoordinatorConfig::default();
            zero(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { key, value, .. }) => {
                    assert_eq!(key, expected);
                    assert_eq!(value, "0");
                }
                other => panic!("{expected}: expected Invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn sub_millisecond_heartbeat_counts_as_zero() {
        let mut config = CoordinatorConfig::default();
        config.health.heartbeat_interval = Duration::from_micros(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.scheduler.rpc_timeout, Duration::from_secs(300));
        assert_eq!(config.scheduler.task_timeout, Duration::from_secs(1800));
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.aggregation_timeout, Duration::from_secs(600));
        assert_eq!(config.health.miss_factor, 3);
        assert_eq!(config.health.check_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.scheduler.retained_tasks, 10_000);
        assert_eq!(config.retained_comparisons, 1_000);
        assert_eq!(config.stop_grace, Duration::from_secs(5));
    }
}
