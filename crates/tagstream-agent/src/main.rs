//! # tagstream-agent
//!
//! Discovers TI SensorTags over BlueZ and streams their sensor readings to a
//! telemetry sink.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! TAGSTREAM_CONFIG=./config.toml cargo run --package tagstream-agent
//!
//! # Production
//! TAGSTREAM_PRODUCTION=1 ./tagstream-agent
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::Context;
use tagstream_agent::{app, logging};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tagstream-agent");

    let result = start().await;
    if let Err(err) = &result {
        app::report_failure(err);
    }
    result
}

async fn start() -> anyhow::Result<()> {
    let (path, config) = app::load_config().context("Failed to load configuration")?;
    info!(path = %path.display(), mode = ?config.scan.mode, sink = ?config.telemetry.sink, "Configuration loaded");

    app::run(config).await
}
