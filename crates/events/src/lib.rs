//! LingoSub coordinator event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`CoordinatorEvent`]: worker lifecycle, task status and comparison
//!   events, wrapped in a timestamped [`EventEnvelope`].
//!
//! The bus is for observers (daemon logging, UI bridges). Components that
//! must not miss a message (supervisor → health monitor, executions →
//! scheduler) talk over dedicated `mpsc` channels instead.

pub mod bus;

pub use bus::{CoordinatorEvent, EventBus, EventEnvelope};
