//! Static catalog of the sensors a tag exposes.
//!
//! Every per-sensor decision in the crate (which protocol steps to run, the
//! default sampling period, how a reading is named and rounded) is driven by
//! the [`SensorDescriptor`] returned from [`descriptor_for`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// One measurable quantity a tag can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Three-axis magnetometer.
    Magnetometer,
    /// Ambient light sensor.
    Luxometer,
    /// Relative humidity with on-chip temperature.
    Humidity,
    /// Infrared thermopile (object and ambient temperature).
    IrTemperature,
    /// Three-axis gyroscope.
    Gyroscope,
    /// Three-axis accelerometer.
    Accelerometer,
    /// Barometric pressure.
    BarometricPressure,
    /// The two buttons and the reed relay.
    SimpleKey,
}

impl SensorKind {
    /// Every sensor kind, in configuration order.
    pub const ALL: [Self; 8] = [
        Self::IrTemperature,
        Self::Humidity,
        Self::Luxometer,
        Self::Magnetometer,
        Self::Gyroscope,
        Self::Accelerometer,
        Self::BarometricPressure,
        Self::SimpleKey,
    ];

    /// Protocol-level name, as used in notification event names
    /// (`<name>Change`) and log messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Magnetometer => "magnetometer",
            Self::Luxometer => "luxometer",
            Self::Humidity => "humidity",
            Self::IrTemperature => "irTemperature",
            Self::Gyroscope => "gyroscope",
            Self::Accelerometer => "accelerometer",
            Self::BarometricPressure => "barometricPressure",
            Self::SimpleKey => "simpleKey",
        }
    }

    /// The descriptor for this kind.
    #[must_use]
    pub fn descriptor(self) -> &'static SensorDescriptor {
        descriptor_for(self)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protocol steps a sensor needs during configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Sensor must be switched on before it reports.
    pub enable: bool,
    /// Sensor accepts a sampling period.
    pub set_period: bool,
    /// Sensor pushes notifications.
    pub subscribe: bool,
}

/// A single numeric channel of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Event name (per-channel shapes) or component key (vector shapes).
    pub name: &'static str,
    /// Decimal places kept when the value is published.
    pub precision: Option<u8>,
}

/// How a reading's channels map onto published events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventShape {
    /// One event per channel, named after the channel.
    PerChannel,
    /// A single `{x, y, z}` event with the given name.
    Vector(&'static str),
    /// One boolean event per channel.
    Flags,
}

/// Static description of one sensor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescriptor {
    /// The kind described.
    pub kind: SensorKind,
    /// Sampling period used when the user gives none. Zero for sensors
    /// without a period.
    pub default_period_ms: u32,
    /// Protocol steps the sensor needs.
    pub capabilities: Capabilities,
    /// Channels of a raw reading, in transport order.
    pub channels: &'static [Channel],
    /// Mapping from channels to events.
    pub shape: EventShape,
}

impl SensorDescriptor {
    /// Number of numeric channels in a raw reading.
    #[must_use]
    pub const fn arity(&self) -> usize {
        self.channels.len()
    }
}

const FULL: Capabilities = Capabilities {
    enable: true,
    set_period: true,
    subscribe: true,
};

const NOTIFY_ONLY: Capabilities = Capabilities {
    enable: false,
    set_period: false,
    subscribe: true,
};

const fn channel(name: &'static str, precision: u8) -> Channel {
    Channel {
        name,
        precision: Some(precision),
    }
}

const XYZ_1: &[Channel] = &[channel("x", 1), channel("y", 1), channel("z", 1)];

static DESCRIPTORS: [SensorDescriptor; 8] = [
    SensorDescriptor {
        kind: SensorKind::Magnetometer,
        default_period_ms: 2000,
        capabilities: FULL,
        channels: XYZ_1,
        shape: EventShape::Vector("magnetometer"),
    },
    SensorDescriptor {
        kind: SensorKind::Luxometer,
        default_period_ms: 2500,
        capabilities: FULL,
        channels: &[channel("lux", 0)],
        shape: EventShape::PerChannel,
    },
    SensorDescriptor {
        kind: SensorKind::Humidity,
        default_period_ms: 2500,
        capabilities: FULL,
        channels: &[channel("humidityTemperature", 1), channel("humidity", 1)],
        shape: EventShape::PerChannel,
    },
    SensorDescriptor {
        kind: SensorKind::IrTemperature,
        default_period_ms: 2500,
        capabilities: FULL,
        channels: &[
            channel("objectTemperature", 1),
            channel("ambientTemperature", 1),
        ],
        shape: EventShape::PerChannel,
    },
    SensorDescriptor {
        kind: SensorKind::Gyroscope,
        default_period_ms: 1000,
        capabilities: FULL,
        channels: XYZ_1,
        shape: EventShape::Vector("gyroscope"),
    },
    SensorDescriptor {
        kind: SensorKind::Accelerometer,
        default_period_ms: 1000,
        capabilities: FULL,
        channels: XYZ_1,
        shape: EventShape::Vector("accelerometer"),
    },
    SensorDescriptor {
        kind: SensorKind::BarometricPressure,
        default_period_ms: 2000,
        capabilities: FULL,
        channels: &[channel("barometricPressure", 2)],
        shape: EventShape::PerChannel,
    },
    SensorDescriptor {
        kind: SensorKind::SimpleKey,
        default_period_ms: 0,
        capabilities: NOTIFY_ONLY,
        channels: &[
            Channel {
                name: "leftKey",
                precision: None,
            },
            Channel {
                name: "rightKey",
                precision: None,
            },
            Channel {
                name: "reedRelay",
                precision: None,
            },
        ],
        shape: EventShape::Flags,
    },
];

/// Look up the static descriptor for a sensor kind.
#[must_use]
pub fn descriptor_for(kind: SensorKind) -> &'static SensorDescriptor {
    match kind {
        SensorKind::Magnetometer => &DESCRIPTORS[0],
        SensorKind::Luxometer => &DESCRIPTORS[1],
        SensorKind::Humidity => &DESCRIPTORS[2],
        SensorKind::IrTemperature => &DESCRIPTORS[3],
        SensorKind::Gyroscope => &DESCRIPTORS[4],
        SensorKind::Accelerometer => &DESCRIPTORS[5],
        SensorKind::BarometricPressure => &DESCRIPTORS[6],
        SensorKind::SimpleKey => &DESCRIPTORS[7],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_maps_to_its_own_descriptor() {
        for kind in SensorKind::ALL {
            assert_eq!(descriptor_for(kind).kind, kind);
        }
    }

    #[test]
    fn test_arity_is_between_one_and_three() {
        for kind in SensorKind::ALL {
            let arity = descriptor_for(kind).arity();
            assert!((1..=3).contains(&arity), "{kind} has arity {arity}");
        }
    }

    #[test]
    fn test_default_periods() {
        assert_eq!(descriptor_for(SensorKind::Magnetometer).default_period_ms, 2000);
        assert_eq!(descriptor_for(SensorKind::Luxometer).default_period_ms, 2500);
        assert_eq!(descriptor_for(SensorKind::Humidity).default_period_ms, 2500);
        assert_eq!(descriptor_for(SensorKind::IrTemperature).default_period_ms, 2500);
    }

    #[test]
    fn test_simple_key_only_subscribes() {
        let caps = descriptor_for(SensorKind::SimpleKey).capabilities;
        assert!(!caps.enable);
        assert!(!caps.set_period);
        assert!(caps.subscribe);
    }

    #[test]
    fn test_precision_is_zero_one_or_two() {
        for kind in SensorKind::ALL {
            for channel in descriptor_for(kind).channels {
                if let Some(p) = channel.precision {
                    assert!(p <= 2, "{kind}.{} has precision {p}", channel.name);
                }
            }
        }
    }

    #[test]
    fn test_display_uses_protocol_name() {
        assert_eq!(SensorKind::IrTemperature.to_string(), "irTemperature");
        assert_eq!(SensorKind::BarometricPressure.to_string(), "barometricPressure");
    }
}
