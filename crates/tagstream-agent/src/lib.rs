//! # tagstream-agent
//!
//! Long-running agent that discovers SensorTags, streams their readings and
//! publishes them to the configured telemetry sink.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod app;
pub mod http_sink;
pub mod logging;
