//! Structured logging initialization.
//!
//! The gateway emits JSON log lines by default (one record per request
//! from the logging middleware plus component lifecycle events). Output
//! goes to stdout or stderr per config; `RUST_LOG` overrides the level.

use eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LogOutput;

/// Initialize the JSON subscriber. Called once from `main`.
pub fn init_tracing(output: LogOutput) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match output {
        LogOutput::Stdout => Registry::default()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .try_init(),
        LogOutput::Stderr => Registry::default()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .map_err(|e| eyre::eyre!("failed to initialize tracing subscriber: {e}"))
}

/// Console-friendly subscriber for local development and examples.
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
        .try_init()
        .map_err(|e| eyre::eyre!("failed to initialize console tracing: {e}"))
}
