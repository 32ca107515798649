//! Process logging setup.
//!
//! - **Production**: JSON to daily rolling files plus compact stdout for
//!   the journal
//! - **Development**: pretty stdout with span events
//!
//! The level comes from `RUST_LOG`, then `TAGSTREAM_LOG_LEVEL`, then `info`.
//! Telemetry records written by the log sink use the `tagstream::telemetry`
//! target, so `RUST_LOG=tagstream::telemetry=info` isolates them.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the default log level.
pub const LOG_LEVEL_ENV: &str = "TAGSTREAM_LOG_LEVEL";

/// Environment variable switching to production logging.
pub const PRODUCTION_ENV: &str = "TAGSTREAM_PRODUCTION";

const LOG_FILE_PREFIX: &str = "tagstream";

// Writer guards must outlive every log call.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Whether `TAGSTREAM_PRODUCTION` asks for production logging.
#[must_use]
pub fn is_production() -> bool {
    std::env::var(PRODUCTION_ENV).is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the level filter cannot be parsed.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let env_filter = resolve_filter(
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
        std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
    )?;

    if is_production {
        init_production(env_filter);
    } else {
        init_development(env_filter);
    }

    Ok(())
}

/// Valid `RUST_LOG` directives win, then the `TAGSTREAM_LOG_LEVEL` value,
/// then `info`.
fn resolve_filter(rust_log: Option<&str>, level: Option<&str>) -> Result<EnvFilter, ParseError> {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .map_or_else(|| EnvFilter::try_new(level.unwrap_or("info")), Ok)
}

fn init_production(env_filter: EnvFilter) {
    let log_dir = log_directory();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Cannot create log directory {}: {e}", log_dir.display());
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Directory for production log files.
fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/tagstream")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "tagstream")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins_over_level() {
        let filter = resolve_filter(Some("tagstream_core=debug"), Some("warn")).unwrap();
        assert_eq!(filter.to_string(), "tagstream_core=debug");
    }

    #[test]
    fn test_level_used_without_rust_log() {
        assert_eq!(resolve_filter(None, Some("warn")).unwrap().to_string(), "warn");
        assert_eq!(resolve_filter(None, None).unwrap().to_string(), "info");
    }

    #[test]
    fn test_invalid_rust_log_falls_back_to_level() {
        let filter = resolve_filter(Some("tagstream=loud"), Some("error")).unwrap();
        assert_eq!(filter.to_string(), "error");
    }

    #[test]
    fn test_invalid_level_is_an_error() {
        assert!(resolve_filter(None, Some("tagstream=loud")).is_err());
    }
}
