//! A deterministic reference engine that speaks the sidecar wire protocol.
//!
//! Used for development and end-to-end tests in place of a real
//! speech-recognition engine. It answers `get_capabilities`, `health_check`
//! and `get_metrics`, echoes text for `transcribe`, honours `cancel` and
//! `shutdown`, emits heartbeats and can be told to misbehave (crash, fail,
//! report itself sick, stay silent).
//!
//! The engine runs over any `AsyncRead`/`AsyncWrite` pair, so it can be
//! driven over real stdio by the `lingosub-mock-engine` binary or embedded
//! in-process over `tokio::io::duplex`.

pub mod config;
pub mod engine;

pub use config::{ConfigError, HealthAnswer, MockEngineConfig};
pub use engine::{serve, ExitReason};
