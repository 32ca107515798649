//! Conversion from raw sensor readings to canonical telemetry events.
//!
//! Event names and channel mapping follow the sensor's
//! [`SensorDescriptor`](crate::sensor::SensorDescriptor):
//!
//! | Sensor               | Events                                           |
//! |----------------------|--------------------------------------------------|
//! | `irTemperature`      | `objectTemperature`, `ambientTemperature`        |
//! | `humidity`           | `humidityTemperature`, `humidity`                |
//! | `luxometer`          | `lux`                                            |
//! | `magnetometer`       | `magnetometer {x, y, z}`                         |
//! | `gyroscope`          | `gyroscope {x, y, z}`                            |
//! | `accelerometer`      | `accelerometer {x, y, z}`                        |
//! | `barometricPressure` | `barometricPressure`                             |
//! | `simpleKey`          | `leftKey`, `rightKey`, `reedRelay`               |
//!
//! A channel the transport did not report is published as `0`.

use crate::sensor::{descriptor_for, Channel, EventShape, SensorKind};
use crate::telemetry::{EventValue, Measurement, TelemetryEvent};
use crate::transport::RawReading;

/// Normalize one raw notification into one or more events.
#[must_use]
pub fn normalize(kind: SensorKind, raw: &RawReading) -> Vec<TelemetryEvent> {
    let descriptor = descriptor_for(kind);
    let measure = |index: usize, channel: &Channel| {
        Measurement::new(raw.channel(index).unwrap_or(0.0), channel.precision)
    };

    match descriptor.shape {
        EventShape::PerChannel => descriptor
            .channels
            .iter()
            .enumerate()
            .map(|(i, ch)| TelemetryEvent::new(ch.name, EventValue::Number(measure(i, ch))))
            .collect(),
        EventShape::Vector(name) => {
            let [x, y, z] = [0, 1, 2].map(|i| measure(i, &descriptor.channels[i]));
            vec![TelemetryEvent::new(name, EventValue::Vector { x, y, z })]
        }
        EventShape::Flags => descriptor
            .channels
            .iter()
            .enumerate()
            .map(|(i, ch)| {
                let on = raw.channel(i).is_some_and(|v| v != 0.0);
                TelemetryEvent::new(ch.name, EventValue::Flag(on))
            })
            .collect(),
    }
}

/// Log messages for the keys held down in a simple-key reading.
#[must_use]
pub fn key_press_messages(raw: &RawReading) -> Vec<&'static str> {
    let pressed = |i: usize| raw.channel(i).is_some_and(|v| v != 0.0);
    let mut messages = Vec::new();
    if pressed(0) {
        messages.push("Left key pressed.");
    }
    if pressed(1) {
        messages.push("Right key pressed.");
    }
    messages
}
