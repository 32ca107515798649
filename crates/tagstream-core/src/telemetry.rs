//! Telemetry records and the publish sink they are delivered to.
//!
//! Two record types leave the core: [`LogRecord`] (the user-visible log
//! stream) and [`TelemetryEvent`] (normalized sensor readings and
//! connectivity status). Both go through a [`TelemetrySink`]; delivery is
//! fire-and-forget, see [`Publisher`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::PublishError;

/// Name of the connectivity status event.
pub const STATUS_EVENT: &str = "sensorTagStatus";

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Normal operation.
    Info,
    /// A step failed.
    Error,
}

/// Entry in the user-visible log stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogRecord {
    /// An info record without data.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: message.into(),
            data: None,
        }
    }

    /// An error record without data.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Error,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A number kept at a fixed number of decimal places.
///
/// With a precision the value serializes as its fixed-point string
/// (`"1.2"`); without one it serializes as a plain JSON number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    value: f64,
    precision: Option<u8>,
}

impl Measurement {
    /// Round `value` to `precision` decimal places.
    ///
    /// Non-finite input becomes `0`, and a result of `-0` becomes `0`.
    #[must_use]
    pub fn new(value: f64, precision: Option<u8>) -> Self {
        let value = if value.is_finite() { value } else { 0.0 };
        let value = match precision {
            Some(places) => {
                let scale = 10f64.powi(i32::from(places));
                (value * scale).round() / scale
            }
            None => value,
        };
        // Collapses -0.0 so it never prints with a sign.
        let value = if value == 0.0 { 0.0 } else { value };
        Self { value, precision }
    }

    /// The rounded value.
    #[must_use]
    pub const fn as_f64(&self) -> f64 {
        self.value
    }

    /// Decimal places, if fixed.
    #[must_use]
    pub const fn precision(&self) -> Option<u8> {
        self.precision
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.precision {
            Some(places) => write!(f, "{:.*}", usize::from(places), self.value),
            None => write!(f, "{}", self.value),
        }
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.precision {
            Some(_) => serializer.collect_str(self),
            None => serializer.serialize_f64(self.value),
        }
    }
}

/// Payload of a [`TelemetryEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventValue {
    /// Single-channel reading.
    Number(Measurement),
    /// Three-axis reading.
    Vector {
        /// X axis.
        x: Measurement,
        /// Y axis.
        y: Measurement,
        /// Z axis.
        z: Measurement,
    },
    /// Button or relay state.
    Flag(bool),
    /// Connectivity status.
    Status {
        /// Whether the tag is connected.
        connected: bool,
    },
}

/// A normalized event, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    /// Canonical event name.
    pub name: String,
    /// Event payload.
    #[serde(rename = "data")]
    pub value: EventValue,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Create an event stamped with the current time.
    pub fn new(name: impl Into<String>, value: EventValue) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// A `sensorTagStatus` event.
    #[must_use]
    pub fn status(connected: bool) -> Self {
        Self::new(STATUS_EVENT, EventValue::Status { connected })
    }
}

/// Destination for log records and telemetry events.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Publish one log record.
    async fn publish_log(&self, record: &LogRecord) -> Result<(), PublishError>;

    /// Publish one telemetry event.
    async fn publish_event(&self, event: &TelemetryEvent) -> Result<(), PublishError>;
}

/// Sink that writes records to `tracing` under the `tagstream::telemetry`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn publish_log(&self, record: &LogRecord) -> Result<(), PublishError> {
        let data = record
            .data
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        match record.level {
            LogLevel::Info => info!(target: "tagstream::telemetry", data = %data, "{}", record.message),
            LogLevel::Error => error!(target: "tagstream::telemetry", data = %data, "{}", record.message),
        }
        Ok(())
    }

    async fn publish_event(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        let data = serde_json::to_string(&event.value)?;
        info!(target: "tagstream::telemetry", name = %event.name, data = %data, "event");
        Ok(())
    }
}

/// Fire-and-forget front end for a [`TelemetrySink`].
///
/// Failures are reported through `tracing` and dropped; nothing is retried.
#[derive(Clone)]
pub struct Publisher {
    sink: Arc<dyn TelemetrySink>,
}

impl Publisher {
    /// Wrap a sink.
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    /// Publish a log record, ignoring failures.
    pub async fn log(&self, record: LogRecord) {
        if let Err(e) = self.sink.publish_log(&record).await {
            warn!(error = %e, message = %record.message, "Dropped log record");
        }
    }

    /// Publish an event, ignoring failures.
    pub async fn event(&self, event: TelemetryEvent) {
        debug!(name = %event.name, "Publishing event");
        if let Err(e) = self.sink.publish_event(&event).await {
            warn!(error = %e, name = %event.name, "Dropped telemetry event");
        }
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_measurement_formats_fixed_precision() {
        assert_eq!(Measurement::new(1.23456, Some(1)).to_string(), "1.2");
        assert_eq!(Measurement::new(9.8, Some(2)).to_string(), "9.80");
        assert_eq!(Measurement::new(1013.256, Some(0)).to_string(), "1013");
    }

    #[test]
    fn test_measurement_never_prints_negative_zero() {
        let m = Measurement::new(-0.001, Some(1));
        assert_eq!(m.to_string(), "0.0");
        assert!(m.as_f64().is_sign_positive());
    }

    #[test]
    fn test_non_finite_measurement_is_zero() {
        assert_eq!(Measurement::new(f64::NAN, Some(0)).as_f64(), 0.0);
        assert_eq!(Measurement::new(f64::INFINITY, None).as_f64(), 0.0);
    }

    #[test]
    fn test_event_serializes_value_as_data() {
        let event = TelemetryEvent::new(
            "accelerometer",
            EventValue::Vector {
                x: Measurement::new(1.0, Some(1)),
                y: Measurement::new(0.0, Some(1)),
                z: Measurement::new(9.8, Some(1)),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "accelerometer");
        assert_eq!(json["data"], json!({"x": "1.0", "y": "0.0", "z": "9.8"}));
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_status_event_shape() {
        let json = serde_json::to_value(TelemetryEvent::status(false)).unwrap();
        assert_eq!(json["name"], STATUS_EVENT);
        assert_eq!(json["data"], json!({"connected": false}));
    }

    #[test]
    fn test_log_record_omits_missing_data() {
        let json = serde_json::to_value(LogRecord::info("Sensortag discovered.")).unwrap();
        assert_eq!(json, json!({"level": "info", "message": "Sensortag discovered."}));

        let json =
            serde_json::to_value(LogRecord::error("boom").with_data(json!({"period": 2500})))
                .unwrap();
        assert_eq!(json["level"], "error");
        assert_eq!(json["data"]["period"], 2500);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_everything() {
        let sink = TracingSink;
        assert!(sink.publish_log(&LogRecord::info("hello")).await.is_ok());
        assert!(sink
            .publish_event(&TelemetryEvent::status(true))
            .await
            .is_ok());
    }
}
