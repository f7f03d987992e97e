//! Shared domain types and pure policy functions for the LingoSub engine
//! coordinator.
//!
//! Everything in this crate is synchronous and free of I/O so that the
//! sidecar, scheduler and any future tooling can share the same
//! definitions:
//!
//! - [`types`]: identifiers and timestamps.
//! - [`capability`]: the closed set of speech-recognition engines.
//! - [`error`]: error codes surfaced to callers and failure causes.
//! - [`scheduling`]: task priorities, aging and the task state machine.
//! - [`worker_pool`]: worker lifecycle state machine, liveness and
//!   worker selection policy.
//! - [`backoff`]: exponential backoff with jitter for restarts.
//! - [`similarity`]: text similarity and result scoring for comparisons.

pub mod backoff;
pub mod capability;
pub mod error;
pub mod scheduling;
pub mod similarity;
pub mod types;
pub mod worker_pool;
