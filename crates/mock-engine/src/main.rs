//! `lingosub-mock-engine`: reference sidecar speaking the worker protocol
//! on stdin/stdout.
//!
//! Logs go to stderr; stdout carries only protocol frames. See
//! [`MockEngineConfig::from_env`] for the environment variables.
//!
//! Exit codes: `0` after `shutdown` or end of input, `3` after a simulated
//! crash.

use anyhow::Context;
use lingosub_mock_engine::{serve, ExitReason, MockEngineConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status used for a simulated crash.
const CRASH_EXIT_CODE: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lingosub_mock_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = MockEngineConfig::from_env().context("invalid mock engine configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let reason = serve(config, tokio::io::stdin(), tokio::io::stdout(), cancel).await;

    let code = match reason {
        ExitReason::Crashed => CRASH_EXIT_CODE,
        ExitReason::Shutdown | ExitReason::InputClosed => 0,
    };
    // The blocking stdin reader would otherwise keep the runtime alive
    // until the coordinator closes the pipe.
    std::process::exit(code);
}
