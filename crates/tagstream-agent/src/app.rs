//! Agent wiring: sink selection, supervisor startup and signal handling.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tagstream_core::config::{Config, SinkKind, TelemetryConfig};
use tagstream_core::error::{Result as CoreResult, TagstreamError};
use tagstream_core::supervisor::{Supervisor, SupervisorConfig};
use tagstream_core::telemetry::{Publisher, TelemetrySink, TracingSink};
use tagstream_core::transport::Scanner;
use tracing::{error, info, warn};

use crate::http_sink::{HttpSink, SinkError};

/// Locate and load the configuration file.
///
/// # Errors
///
/// Returns an error if no path can be determined or the file is invalid.
pub fn load_config() -> CoreResult<(PathBuf, Config)> {
    let path = Config::config_path()?;
    let config = Config::load_from(&path)?;
    Ok((path, config))
}

/// One-line operator hint for a startup failure.
#[must_use]
pub const fn failure_hint(err: &TagstreamError) -> &'static str {
    if err.is_config_error() {
        "check the configuration file and TAGSTREAM__* overrides"
    } else if err.is_transport_error() {
        "check that bluetoothd is running and the adapter is powered"
    } else {
        "restart the agent"
    }
}

/// Log `err` with its error code when it carries a [`TagstreamError`].
pub fn report_failure(err: &anyhow::Error) {
    match err.downcast_ref::<TagstreamError>() {
        Some(cause) => error!(
            code = cause.error_code(),
            recoverable = cause.is_recoverable(),
            hint = failure_hint(cause),
            "{err:#}"
        ),
        None => error!("{err:#}"),
    }
}

/// Build the sink selected by `telemetry.sink`.
///
/// # Errors
///
/// Returns an error if the HTTP sink is selected but cannot be built.
pub fn build_sink(config: &TelemetryConfig) -> Result<Arc<dyn TelemetrySink>, SinkError> {
    Ok(match config.sink {
        SinkKind::Log => Arc::new(TracingSink),
        SinkKind::Http => Arc::new(HttpSink::from_config(config)?),
    })
}

/// Supervise `scanner` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if discovery cannot be started.
pub async fn run_with<S: Scanner>(
    scanner: S,
    config: &Config,
    sink: Arc<dyn TelemetrySink>,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let settings = SupervisorConfig::from_config(config);
    info!(
        mode = ?settings.mode,
        sensors = ?settings.sensors.enabled().map(|(kind, _)| kind).collect::<Vec<_>>(),
        "Starting supervisor"
    );
    let supervisor = Supervisor::new(scanner, settings, Publisher::new(sink));
    supervisor
        .run(shutdown)
        .await
        .context("Supervisor failed")?;
    info!("Supervisor stopped");
    Ok(())
}

/// Run the agent on the system Bluetooth adapter until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the sink, the adapter or discovery cannot be set up.
#[cfg(feature = "bluetooth")]
pub async fn run(config: Config) -> anyhow::Result<()> {
    use tagstream_core::transport::bluez::BluezScanner;

    let sink = build_sink(&config.telemetry).context("Failed to create telemetry sink")?;
    let name_filter = config.name_filter().map_err(TagstreamError::from)?;
    let scanner = BluezScanner::new(config.scan.adapter.as_deref(), name_filter)
        .await
        .map_err(TagstreamError::from)
        .context("Failed to open Bluetooth adapter")?;
    run_with(scanner, &config, sink, shutdown_signal()).await
}

/// Without the `bluetooth` feature there is no transport to run on.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(feature = "bluetooth"))]
pub async fn run(_config: Config) -> anyhow::Result<()> {
    anyhow::bail!("tagstream-agent was built without the `bluetooth` feature")
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Cannot install signal handlers; falling back to Ctrl+C");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown..."),
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl+C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagstream_core::config::SensorOverride;
    use tagstream_core::mock::{wait_until, MemorySink, MockPeripheral, MockScanner};
    use tagstream_core::sensor::SensorKind;
    use tagstream_core::transport::{DeviceIdentity, RawReading};
    use tokio::sync::oneshot;

    #[test]
    fn test_failure_hints_follow_error_kind() {
        use tagstream_core::error::{ConfigError, TransportError};

        let config = TagstreamError::from(ConfigError::MissingEndpoint);
        assert!(failure_hint(&config).contains("configuration"));
        let transport = TagstreamError::from(TransportError::AdapterPoweredOff);
        assert!(failure_hint(&transport).contains("bluetoothd"));
        assert_eq!(failure_hint(&TagstreamError::AlreadyRunning), "restart the agent");
    }

    #[tokio::test]
    async fn test_start_failure_keeps_error_code() {
        let scanner = MockScanner::new();
        scanner.fail_start("no adapter");
        let err = run_with(
            scanner,
            &Config::default(),
            Arc::new(MemorySink::new()),
            std::future::pending(),
        )
        .await
        .unwrap_err();

        let cause = err.downcast_ref::<TagstreamError>().unwrap();
        assert_eq!(cause.error_code(), "BLUETOOTH_BACKEND_ERROR");
        assert!(format!("{err:#}").starts_with("Supervisor failed: "));
    }

    #[test]
    fn test_log_sink_is_default() {
        assert!(build_sink(&TelemetryConfig::default()).is_ok());
    }

    #[test]
    fn test_http_sink_without_endpoint_fails() {
        let config = TelemetryConfig {
            sink: SinkKind::Http,
            ..TelemetryConfig::default()
        };
        assert!(matches!(build_sink(&config), Err(SinkError::MissingEndpoint)));
    }

    #[tokio::test]
    async fn test_agent_streams_until_shutdown() {
        let mut config = Config::default();
        config.sensors = tagstream_core::config::SensorOptions::none();
        config
            .sensors
            .set(SensorKind::Accelerometer, Some(SensorOverride::period(1000)));
        config.session.read_metadata = false;

        let scanner = MockScanner::new();
        let sink = Arc::new(MemorySink::new());
        let (stop, stopped) = oneshot::channel::<()>();
        let agent = tokio::spawn({
            let scanner = scanner.clone();
            let sink = sink.clone();
            async move {
                run_with(scanner, &config, sink, async move {
                    let _ = stopped.await;
                })
                .await
            }
        });

        assert!(wait_until(|| scanner.is_scanning()).await);
        let peripheral = MockPeripheral::new();
        assert!(scanner.report(DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "cc2650"), peripheral.clone()));
        assert!(wait_until(|| peripheral.is_subscribed(SensorKind::Accelerometer)).await);

        peripheral.notify(SensorKind::Accelerometer, RawReading::new(&[0.04, -0.98, 0.11]));
        assert!(wait_until(|| sink.has_event("accelerometer")).await);
        let event = serde_json::to_value(&sink.events_named("accelerometer")[0]).unwrap();
        assert_eq!(event["data"], serde_json::json!({"x": "0.0", "y": "-1.0", "z": "0.1"}));

        stop.send(()).unwrap();
        agent.await.unwrap().unwrap();
        assert!(!scanner.is_scanning());
        assert!(sink.has_log("Sensortag disconnected."));
    }
}
