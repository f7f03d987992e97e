//! Engine capabilities.
//!
//! Every worker process provides exactly one speech-recognition engine.
//! The set of engines is closed: adding a backend means adding a variant
//! here, which forces every `match` in the coordinator to handle it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A speech-recognition backend a worker process can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EngineCapability {
    #[serde(rename = "funasr")]
    FunAsr,
    #[serde(rename = "whisper")]
    Whisper,
    #[serde(rename = "faster_whisper")]
    FasterWhisper,
    #[serde(rename = "sensevoice")]
    SenseVoice,
    /// Deterministic engine used in development and tests.
    #[serde(rename = "test")]
    Test,
}

impl EngineCapability {
    pub const ALL: [EngineCapability; 5] = [
        EngineCapability::FunAsr,
        EngineCapability::Whisper,
        EngineCapability::FasterWhisper,
        EngineCapability::SenseVoice,
        EngineCapability::Test,
    ];

    /// Wire name of the engine, as used in configs and the protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            EngineCapability::FunAsr => "funasr",
            EngineCapability::Whisper => "whisper",
            EngineCapability::FasterWhisper => "faster_whisper",
            EngineCapability::SenseVoice => "sensevoice",
            EngineCapability::Test => "test",
        }
    }

    /// Whether this engine satisfies a task that accepts any of `accepted`.
    pub fn satisfies(self, accepted: &[EngineCapability]) -> bool {
        accepted.contains(&self)
    }
}

impl fmt::Display for EngineCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineCapability {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EngineCapability::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| CoreError::UnknownCapability(s.to_string()))
    }
}

/// Validate a set of accepted engines for a task submission.
///
/// Rules:
/// - Must not be empty.
/// - Must not contain duplicates.
pub fn validate_engine_set(engines: &[EngineCapability]) -> Result<(), CoreError> {
    if engines.is_empty() {
        return Err(CoreError::Validation(
            "At least one engine capability is required".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::with_capacity(engines.len());
    for engine in engines {
        if !seen.insert(*engine) {
            return Err(CoreError::Validation(format!(
                "Duplicate engine capability: \"{engine}\""
            )));
        }
    }
    Ok(())
}
