//! Mock engine configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use lingosub_core::capability::EngineCapability;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How the engine answers `health_check`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthAnswer {
    #[default]
    Healthy,
    Unhealthy,
    /// Never answer.
    Silent,
}

impl FromStr for HealthAnswer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(HealthAnswer::Healthy),
            "unhealthy" => Ok(HealthAnswer::Unhealthy),
            "silent" => Ok(HealthAnswer::Silent),
            other => Err(format!("expected healthy, unhealthy or silent, got '{other}'")),
        }
    }
}

/// Behaviour of one mock engine process.
#[derive(Debug, Clone)]
pub struct MockEngineConfig {
    /// Engine advertised in capabilities and heartbeats.
    pub engine: EngineCapability,
    pub slots: u32,
    /// Simulated processing time per transcription.
    pub delay: Duration,
    /// Fixed transcript. When `None`, `payload.text` is echoed back.
    pub text: Option<String>,
    pub confidence: f64,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Exit abruptly on the transcription request after this many have
    /// been accepted.
    pub crash_after: Option<u32>,
    /// Answer every transcription with an engine error.
    pub fail_transcriptions: bool,
    /// Send a `progress` notification halfway through each transcription.
    pub report_progress: bool,
    pub health: HealthAnswer,
}

impl Default for MockEngineConfig {
    fn default() -> Self {
        Self {
            engine: EngineCapability::Test,
            slots: 1,
            delay: Duration::ZERO,
            text: None,
            confidence: 0.9,
            heartbeat_interval: Some(Duration::from_secs(1)),
            crash_after: None,
            fail_transcriptions: false,
            report_progress: false,
            health: HealthAnswer::Healthy,
        }
    }
}

impl MockEngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default          |
    /// |-------------------------------|------------------|
    /// | `MOCK_ENGINE_ID`              | `test`           |
    /// | `MOCK_ENGINE_SLOTS`           | `1`              |
    /// | `MOCK_ENGINE_DELAY_MS`        | `0`              |
    /// | `MOCK_ENGINE_TEXT`            | echo payload     |
    /// | `MOCK_ENGINE_CONFIDENCE`      | `0.9`            |
    /// | `MOCK_ENGINE_HEARTBEAT_MS`    | `1000` (0 = off) |
    /// | `MOCK_ENGINE_CRASH_AFTER`     | never            |
    /// | `MOCK_ENGINE_FAIL`            | `false`          |
    /// | `MOCK_ENGINE_PROGRESS`        | `false`          |
    /// | `MOCK_ENGINE_HEALTH`          | `healthy`        |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let engine = env_or("MOCK_ENGINE_ID", defaults.engine)?;
        let slots: u32 = env_or("MOCK_ENGINE_SLOTS", defaults.slots)?;
        let delay_ms: u64 = env_or("MOCK_ENGINE_DELAY_MS", 0)?;
        let text = std::env::var("MOCK_ENGINE_TEXT").ok();
        let confidence = env_or("MOCK_ENGINE_CONFIDENCE", defaults.confidence)?;
        let heartbeat_ms: u64 = env_or("MOCK_ENGINE_HEARTBEAT_MS", 1000)?;
        let crash_after = env_opt("MOCK_ENGINE_CRASH_AFTER")?;
        let fail_transcriptions = env_or("MOCK_ENGINE_FAIL", false)?;
        let report_progress = env_or("MOCK_ENGINE_PROGRESS", false)?;
        let health = env_or("MOCK_ENGINE_HEALTH", defaults.health)?;

        Ok(Self {
            engine,
            slots: slots.max(1),
            delay: Duration::from_millis(delay_ms),
            text,
            confidence,
            heartbeat_interval: (heartbeat_ms > 0).then(|| Duration::from_millis(heartbeat_ms)),
            crash_after,
            fail_transcriptions,
            report_progress,
            health,
        })
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
