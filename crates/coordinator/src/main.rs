//! `lingosub-coordinator`: runs the configured engine workers and the
//! task scheduler until interrupted.
//!
//! Configuration comes from the environment (see
//! [`CoordinatorConfig::from_env`]); `LOG_FORMAT=json` switches logs to
//! JSON lines.

use std::sync::Arc;

use anyhow::Context;
use lingosub_coordinator::{Coordinator, CoordinatorConfig};
use lingosub_events::EventEnvelope;
use lingosub_sidecar::ProcessLauncher;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lingosub_coordinator=info,lingosub_sidecar=info".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = CoordinatorConfig::from_env().context("invalid coordinator configuration")?;
    let served = config.served_engines();
    if served.is_empty() {
        tracing::warn!("No engines configured; set ENGINES_CONFIG to a JSON engines file");
    } else {
        let mut names: Vec<&str> = served.iter().map(|e| e.as_str()).collect();
        names.sort_unstable();
        tracing::info!(engines = ?names, "Serving engines");
    }

    let coordinator = Coordinator::new(config, Arc::new(ProcessLauncher));
    tokio::spawn(log_events(coordinator.subscribe()));
    let ready = coordinator.start_workers().await;
    tracing::info!(ready, "Coordinator running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Interrupted");

    coordinator.shutdown().await;
    Ok(())
}

/// Log every bus event until the bus closes.
async fn log_events(mut events: broadcast::Receiver<EventEnvelope>) {
    loop {
        match events.recv().await {
            Ok(envelope) => match serde_json::to_string(&envelope) {
                Ok(line) => tracing::info!(target: "lingosub_coordinator::events", "{line}"),
                Err(e) => tracing::warn!(error = %e, "Could not serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
