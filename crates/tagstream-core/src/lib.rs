//! # tagstream-core
//!
//! Session lifecycle and sensor configuration for TI SensorTag BLE devices.
//!
//! This crate provides:
//! - Discovery supervision with one session per device
//! - A per-device lifecycle state machine that connects, configures sensors
//!   and streams notifications
//! - Normalization of raw readings into canonical telemetry events
//! - Configuration loading and per-sensor option resolution
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`sensor`] - Static catalog of sensor kinds and their descriptors
//! - [`config`] - Application configuration and sensor option resolution
//! - [`transport`] - The `Scanner`/`Peripheral` seam and the BlueZ backend
//! - [`session`] - Per-device lifecycle and sensor configuration
//! - [`registry`] - Identity to session mapping
//! - [`supervisor`] - Discovery loop, re-arming and shutdown
//! - [`normalizer`] - Raw reading to telemetry event conversion
//! - [`telemetry`] - Log records, events and the publish sink
//! - [`error`] - Error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;
pub mod normalizer;
pub mod registry;
pub mod sensor;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

// Re-export primary types for convenience
pub use config::{
    is_valid_mac_address, resolve, Config, ResolvedSensors, ScanConfig, ScanMode, SensorConfig,
    SensorOptions, SensorOverride, SessionConfig, SinkKind, TelemetryConfig,
};
pub use error::{
    ConfigError, PublishError, RegistryError, Result, TagstreamError, TransportError,
    TransportResult,
};
pub use normalizer::normalize;
pub use registry::SessionRegistry;
pub use sensor::{descriptor_for, SensorDescriptor, SensorKind};
pub use session::{LifecycleState, PeripheralSession, SessionOptions};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use telemetry::{
    EventValue, LogLevel, LogRecord, Measurement, Publisher, TelemetryEvent, TelemetrySink,
    TracingSink,
};
#[cfg(feature = "bluetooth")]
pub use transport::bluez::{BluezPeripheral, BluezScanner};
pub use transport::{DeviceIdentity, MetadataField, Peripheral, RawReading, Scanner};
