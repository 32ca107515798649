//! The BLE transport seam.
//!
//! The core never talks to a Bluetooth stack directly. It drives a
//! [`Scanner`] to find devices and a [`Peripheral`] per found device to
//! connect, configure sensors and receive notifications. Implementations:
//!
//! - [`bluez`] - TI SensorTag GATT profile over BlueZ (feature `bluetooth`)
//! - [`crate::mock`] - scripted in-memory transport (feature `mock-bluetooth`)

use std::fmt;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportResult;
use crate::sensor::SensorKind;

#[cfg(feature = "bluetooth")]
pub mod bluez;

/// Stable identity of a peripheral as reported by the transport.
///
/// Equality and hashing only consider [`id`](Self::id); the type label is
/// informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Address or platform UUID.
    pub id: String,
    /// Device family label (e.g. `cc2650`).
    #[serde(rename = "type")]
    pub device_type: String,
}

impl DeviceIdentity {
    /// Create an identity from an id and a type label.
    pub fn new(id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
        }
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// One notification's worth of decoded channel values.
///
/// A channel the transport did not report is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReading(pub Vec<Option<f64>>);

impl RawReading {
    /// A reading where every channel is present.
    #[must_use]
    pub fn new(values: &[f64]) -> Self {
        Self(values.iter().copied().map(Some).collect())
    }

    /// A reading with no values at all.
    #[must_use]
    pub const fn missing() -> Self {
        Self(Vec::new())
    }

    /// Value of channel `index`, if reported.
    #[must_use]
    pub fn channel(&self, index: usize) -> Option<f64> {
        self.0.get(index).copied().flatten()
    }
}

/// Device information fields read once per connection for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    /// GAP device name.
    DeviceName,
    /// System ID.
    SystemId,
    /// Serial number string.
    SerialNumber,
    /// Firmware revision string.
    FirmwareRevision,
    /// Hardware revision string.
    HardwareRevision,
    /// Software revision string.
    SoftwareRevision,
    /// Manufacturer name string.
    ManufacturerName,
}

impl MetadataField {
    /// Every field, in read order.
    pub const ALL: [Self; 7] = [
        Self::DeviceName,
        Self::SystemId,
        Self::SerialNumber,
        Self::FirmwareRevision,
        Self::HardwareRevision,
        Self::SoftwareRevision,
        Self::ManufacturerName,
    ];

    /// Key used in log data.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceName => "deviceName",
            Self::SystemId => "systemId",
            Self::SerialNumber => "serialNumber",
            Self::FirmwareRevision => "firmwareRevision",
            Self::HardwareRevision => "hardwareRevision",
            Self::SoftwareRevision => "softwareRevision",
            Self::ManufacturerName => "manufacturerName",
        }
    }
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream of decoded notifications for one sensor.
pub type NotificationStream = BoxStream<'static, RawReading>;

/// Stream that yields once per disconnect signal from the transport.
pub type DisconnectStream = BoxStream<'static, ()>;

/// A device reported by discovery.
pub struct DeviceFound<P> {
    /// Identity of the device.
    pub identity: DeviceIdentity,
    /// Handle used to talk to the device.
    pub peripheral: P,
}

impl<P> fmt::Debug for DeviceFound<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFound")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Channel a [`Scanner`] delivers found devices into.
pub type FoundSender<P> = mpsc::UnboundedSender<DeviceFound<P>>;

/// Discovery control.
#[async_trait]
pub trait Scanner: Send + Sync + 'static {
    /// Peripheral handle type produced by this scanner.
    type Peripheral: Peripheral;

    /// Start scanning, or restart it if it is already running, so devices
    /// the stack already knows are reported again.
    async fn start_discovery(&self, found: FoundSender<Self::Peripheral>) -> TransportResult<()>;

    /// Stop scanning. Stopping an idle scanner is a no-op.
    async fn stop_discovery(&self) -> TransportResult<()>;
}

/// Per-device capability used by a
/// [`PeripheralSession`](crate::session::PeripheralSession).
#[async_trait]
pub trait Peripheral: Send + Sync + 'static {
    /// Connect and resolve the services the sensors live on.
    async fn connect_and_setup(&self) -> TransportResult<()>;

    /// Switch a sensor on.
    async fn enable(&self, kind: SensorKind) -> TransportResult<()>;

    /// Set a sensor's sampling period.
    async fn set_period(&self, kind: SensorKind, period_ms: u32) -> TransportResult<()>;

    /// Subscribe to a sensor's notifications.
    async fn subscribe(&self, kind: SensorKind) -> TransportResult<NotificationStream>;

    /// Read one device information field.
    async fn read_metadata(&self, field: MetadataField) -> TransportResult<String>;

    /// Signals emitted whenever the link drops.
    async fn disconnect_signals(&self) -> TransportResult<DisconnectStream>;

    /// Drop the link.
    async fn disconnect(&self) -> TransportResult<()>;
}
