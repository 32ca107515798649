//! Error types for the tagstream core library.
//!
//! Each concern has its own error type ([`TransportError`], [`RegistryError`],
//! [`PublishError`], [`ConfigError`]). [`TagstreamError`] unifies the ones
//! that can stop the agent, for callers that only need one `Result` type.
//! Registry and publish errors are always handled where they happen.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Local handling**: Transport and publish errors are caught where they
//!   happen and reported through the log stream; none of them stops the process
//! - **Context preservation**: Variants carry the sensor kind, operation and
//!   device needed to diagnose the failure from a single log line
//!
//! # Example
//!
//! ```rust
//! use tagstream_core::error::{Result, TagstreamError, TransportError};
//!
//! fn connect(ok: bool) -> Result<()> {
//!     if !ok {
//!         return Err(TransportError::ConnectFailed("timeout".into()).into());
//!     }
//!     Ok(())
//! }
//!
//! assert!(connect(false).unwrap_err().is_recoverable());
//! ```

use thiserror::Error;

use crate::sensor::SensorKind;
use crate::transport::DeviceIdentity;

// =============================================================================
// TRANSPORT ERRORS
// =============================================================================

/// A failure reported by the BLE transport.
///
/// Transport errors are always recoverable: the session that hit one logs it
/// and either skips the failing step or terminates, and discovery is re-armed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    AdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// Establishing the connection or resolving services failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The peripheral does not expose a characteristic the operation needs.
    #[error("Characteristic {uuid} not found on device")]
    CharacteristicNotFound {
        /// UUID of the missing characteristic.
        uuid: String,
    },

    /// A GATT operation for a sensor failed.
    #[error("{operation} {kind} failed: {message}")]
    OperationFailed {
        /// Name of the failed operation (enable, set period, subscribe).
        operation: &'static str,
        /// Sensor the operation targeted.
        kind: SensorKind,
        /// Cause reported by the device or the stack.
        message: String,
    },

    /// The sensor does not support the requested operation.
    #[error("{kind} does not support {operation}")]
    Unsupported {
        /// Sensor the operation targeted.
        kind: SensorKind,
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// Any other failure reported by the Bluetooth stack.
    #[error("{0}")]
    Backend(String),
}

/// A specialized [`Result`] type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

// =============================================================================
// REGISTRY ERRORS
// =============================================================================

/// Errors produced by the [`SessionRegistry`](crate::registry::SessionRegistry).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A session for this identity is already registered.
    #[error("A session for {identity} is already active")]
    AlreadyActive {
        /// Identity that already has a session.
        identity: DeviceIdentity,
    },
}

// =============================================================================
// PUBLISH ERRORS
// =============================================================================

/// A failure delivering a record to the telemetry sink.
///
/// Publishing is fire-and-forget: these errors are logged and dropped.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The sink could not be reached.
    #[error("Telemetry sink unreachable: {0}")]
    Unreachable(String),

    /// The sink answered with a non-success status.
    #[error("Telemetry sink rejected record with status {status}: {body}")]
    Rejected {
        /// Status code returned by the sink.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The record could not be serialized.
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

// =============================================================================
// CONFIGURATION ERRORS
// =============================================================================

/// Errors from loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration sources could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// The platform configuration directory could not be determined.
    #[error("Cannot determine configuration directory")]
    NoConfigDir,

    /// The advertised-name filter is not a valid regular expression.
    #[error("Invalid name filter '{pattern}': {source}")]
    InvalidNameFilter {
        /// The rejected pattern.
        pattern: String,
        /// Regex compilation error.
        #[source]
        source: regex::Error,
    },

    /// An allowlisted device address is malformed.
    #[error("Invalid device address: '{0}'. Expected format XX:XX:XX:XX:XX:XX.")]
    InvalidAddress(String),

    /// The HTTP sink was selected without an endpoint.
    #[error("telemetry.endpoint is required when telemetry.sink = \"http\"")]
    MissingEndpoint,

    /// The HTTP sink endpoint is not a valid URL.
    #[error("Invalid telemetry endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        /// The rejected endpoint.
        endpoint: String,
        /// URL parse error.
        #[source]
        source: url::ParseError,
    },
}

// =============================================================================
// UNIFIED ERROR
// =============================================================================

/// The unified error type for tagstream operations.
#[derive(Debug, Error)]
pub enum TagstreamError {
    /// A BLE transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// [`Supervisor::run`](crate::supervisor::Supervisor::run) was called twice.
    #[error("Supervisor is already running")]
    AlreadyRunning,
}

/// A specialized [`Result`] type for tagstream operations.
pub type Result<T> = std::result::Result<T, TagstreamError>;

impl TagstreamError {
    /// Returns `true` if this error came from the BLE transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns `true` if the process can carry on after this error.
    ///
    /// Configuration errors and a second supervisor run are not.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::AlreadyRunning)
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(TransportError::AdapterNotFound) => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::Transport(TransportError::AdapterPoweredOff) => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::Transport(TransportError::ConnectFailed(_)) => "CONNECT_FAILED",
            Self::Transport(TransportError::CharacteristicNotFound { .. }) => {
                "CHARACTERISTIC_NOT_FOUND"
            }
            Self::Transport(TransportError::OperationFailed { .. }) => "SENSOR_OPERATION_FAILED",
            Self::Transport(TransportError::Unsupported { .. }) => "SENSOR_OPERATION_UNSUPPORTED",
            Self::Transport(TransportError::Backend(_)) => "BLUETOOTH_BACKEND_ERROR",
            Self::Config(_) => "CONFIG_INVALID",
            Self::AlreadyRunning => "SUPERVISOR_ALREADY_RUNNING",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "cc2650")
    }

    #[test]
    fn test_transport_error_classification() {
        let err: TagstreamError = TransportError::ConnectFailed("timeout".into()).into();
        assert!(err.is_transport_error());
        assert!(err.is_recoverable());
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_config_errors_are_not_recoverable() {
        let err: TagstreamError = ConfigError::MissingEndpoint.into();
        assert!(err.is_config_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_second_run_is_not_recoverable() {
        let err = TagstreamError::AlreadyRunning;
        assert!(!err.is_recoverable());
        assert!(!err.is_config_error());
        assert_eq!(err.error_code(), "SUPERVISOR_ALREADY_RUNNING");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TagstreamError::from(TransportError::AdapterNotFound).error_code(),
            "BLUETOOTH_ADAPTER_NOT_FOUND"
        );
        assert_eq!(
            TagstreamError::from(TransportError::ConnectFailed("timeout".into())).error_code(),
            "CONNECT_FAILED"
        );
        assert_eq!(
            TagstreamError::from(ConfigError::NoConfigDir).error_code(),
            "CONFIG_INVALID"
        );
    }

    #[test]
    fn test_error_display_messages() {
        let err = TransportError::OperationFailed {
            operation: "set period",
            kind: SensorKind::Humidity,
            message: "busy".into(),
        };
        assert_eq!(err.to_string(), "set period humidity failed: busy");

        let err = RegistryError::AlreadyActive {
            identity: identity(),
        };
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));

        let err = ConfigError::InvalidAddress("nope".into());
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<TagstreamError>();
        assert_sync::<TagstreamError>();
    }
}
