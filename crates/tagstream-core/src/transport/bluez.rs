//! TI SensorTag transport over BlueZ.
//!
//! Targets the CC2650 GATT profile. Sensor services live under the TI base
//! UUID `F000xxxx-0451-4000-B000-000000000000`; each has a data, a config and
//! (most of them) a period characteristic. Gyroscope, accelerometer and
//! magnetometer share the movement service: one config bitmask and one
//! notification stream, which is fanned out to every movement subscriber.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty, Session, Uuid};
use futures::{future, Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::sensor::SensorKind;
use crate::transport::{
    DeviceFound, DeviceIdentity, DisconnectStream, FoundSender, MetadataField,
    NotificationStream, Peripheral, RawReading, Scanner,
};

/// Advertised-name filter used when none is configured.
static DEFAULT_NAME_FILTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)sensortag").expect("default name filter is valid"));

const SERVICE_RESOLVE_ATTEMPTS: u32 = 50;
const SERVICE_RESOLVE_INTERVAL: Duration = Duration::from_millis(100);

const MOVEMENT_FEED_CAPACITY: usize = 64;

/// How long a device added without a name is watched for one.
const NAME_WAIT: Duration = Duration::from_secs(30);

const fn ti_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0xF000_0000_0451_4000_B000_0000_0000_0000 | ((short as u128) << 96))
}

const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB | ((short as u128) << 96))
}

const SIMPLE_KEY_DATA: Uuid = sig_uuid(0xFFE1);

const MOVEMENT_DATA: Uuid = ti_uuid(0xAA81);

/// GATT characteristics backing one sensor.
#[derive(Debug, Clone, Copy)]
struct GattProfile {
    data: Uuid,
    config: Option<Uuid>,
    period: Option<Uuid>,
}

const fn profile(kind: SensorKind) -> GattProfile {
    const fn ti(data: u16, config: u16, period: u16) -> GattProfile {
        GattProfile {
            data: ti_uuid(data),
            config: Some(ti_uuid(config)),
            period: Some(ti_uuid(period)),
        }
    }
    match kind {
        SensorKind::IrTemperature => ti(0xAA01, 0xAA02, 0xAA03),
        SensorKind::Humidity => ti(0xAA21, 0xAA22, 0xAA23),
        SensorKind::BarometricPressure => ti(0xAA41, 0xAA42, 0xAA44),
        SensorKind::Luxometer => ti(0xAA71, 0xAA72, 0xAA73),
        SensorKind::Gyroscope | SensorKind::Accelerometer | SensorKind::Magnetometer => {
            ti(0xAA81, 0xAA82, 0xAA83)
        }
        SensorKind::SimpleKey => GattProfile {
            data: SIMPLE_KEY_DATA,
            config: None,
            period: None,
        },
    }
}

const fn movement_bits(kind: SensorKind) -> u16 {
    match kind {
        SensorKind::Gyroscope => 0x0007,
        SensorKind::Accelerometer => 0x0038,
        SensorKind::Magnetometer => 0x0040,
        _ => 0,
    }
}

const fn is_movement(kind: SensorKind) -> bool {
    movement_bits(kind) != 0
}

const fn metadata_uuid(field: MetadataField) -> Uuid {
    sig_uuid(match field {
        MetadataField::DeviceName => 0x2A00,
        MetadataField::SystemId => 0x2A23,
        MetadataField::SerialNumber => 0x2A25,
        MetadataField::FirmwareRevision => 0x2A26,
        MetadataField::HardwareRevision => 0x2A27,
        MetadataField::SoftwareRevision => 0x2A28,
        MetadataField::ManufacturerName => 0x2A29,
    })
}

/// Period register value: tens of milliseconds, 100 ms to 2.55 s.
fn period_register(period_ms: u32) -> u8 {
    u8::try_from((period_ms / 10).clamp(10, 255)).unwrap_or(u8::MAX)
}

/// Device family from the advertised name.
fn device_type(name: &str) -> &'static str {
    if name.to_ascii_uppercase().contains("CC2650") {
        "cc2650"
    } else {
        "cc2540"
    }
}

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        match e.kind {
            bluer::ErrorKind::NotFound => Self::AdapterNotFound,
            bluer::ErrorKind::NotReady => Self::AdapterPoweredOff,
            _ => Self::Backend(e.to_string()),
        }
    }
}

// =============================================================================
// DECODING
// =============================================================================

fn u16_at(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn i16_at(bytes: &[u8], at: usize) -> Option<i16> {
    bytes
        .get(at..at + 2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
}

fn u24_at(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 3)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
}

fn axes(bytes: &[u8], offset: usize, scale: f64) -> RawReading {
    RawReading(
        (0..3)
            .map(|axis| i16_at(bytes, offset + axis * 2).map(|v| f64::from(v) * scale))
            .collect(),
    )
}

/// Convert one notification payload to channel values.
///
/// Channels the payload is too short for are reported as missing.
fn decode(kind: SensorKind, bytes: &[u8]) -> RawReading {
    match kind {
        SensorKind::IrTemperature => {
            let celsius = |at| u16_at(bytes, at).map(|raw| f64::from(raw >> 2) * 0.031_25);
            RawReading(vec![celsius(0), celsius(2)])
        }
        SensorKind::Humidity => RawReading(vec![
            u16_at(bytes, 0).map(|raw| f64::from(raw) / 65536.0 * 165.0 - 40.0),
            u16_at(bytes, 2).map(|raw| f64::from(raw & !0x0003) / 65536.0 * 100.0),
        ]),
        SensorKind::BarometricPressure => {
            RawReading(vec![u24_at(bytes, 3).map(|raw| f64::from(raw) / 100.0)])
        }
        SensorKind::Luxometer => RawReading(vec![u16_at(bytes, 0).map(|raw| {
            let mantissa = raw & 0x0FFF;
            let exponent = i32::from(raw >> 12);
            f64::from(mantissa) * 0.01 * 2f64.powi(exponent)
        })]),
        SensorKind::Gyroscope => axes(bytes, 0, 500.0 / 65536.0),
        SensorKind::Accelerometer => axes(bytes, 6, 1.0 / (32768.0 / 2.0)),
        SensorKind::Magnetometer => axes(bytes, 12, 4912.0 / 32768.0),
        SensorKind::SimpleKey => {
            let flag = |mask: u8| bytes.first().map(|b| if b & mask != 0 { 1.0 } else { 0.0 });
            RawReading(vec![flag(0x02), flag(0x01), flag(0x04)])
        }
    }
}

fn metadata_string(field: MetadataField, bytes: &[u8]) -> String {
    match field {
        MetadataField::SystemId => bytes.iter().rev().map(|b| format!("{b:02x}")).collect(),
        _ => String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .to_string(),
    }
}

// =============================================================================
// SCANNER
// =============================================================================

/// Discovery on a BlueZ adapter.
pub struct BluezScanner {
    _session: Session,
    adapter: Adapter,
    name_filter: Regex,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezScanner {
    /// Open `adapter_name` (or the default adapter) and power it on.
    ///
    /// Devices are reported when their advertised name matches
    /// `name_filter`, or contains "SensorTag" when no filter is given.
    ///
    /// # Errors
    ///
    /// Returns an error if BlueZ is unreachable or the adapter is missing or
    /// cannot be powered.
    pub async fn new(adapter_name: Option<&str>, name_filter: Option<Regex>) -> TransportResult<Self> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;
        if !adapter.is_powered().await? {
            return Err(TransportError::AdapterPoweredOff);
        }
        info!(adapter = %adapter.name(), "Bluetooth adapter ready");
        Ok(Self {
            _session: session,
            adapter,
            name_filter: name_filter.unwrap_or_else(|| DEFAULT_NAME_FILTER.clone()),
            task: Mutex::new(None),
        })
    }

    fn abort_task(&self) -> bool {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Scanner for BluezScanner {
    type Peripheral = BluezPeripheral;

    async fn start_discovery(&self, found: FoundSender<BluezPeripheral>) -> TransportResult<()> {
        // Dropping the previous event stream ends that discovery session.
        if self.abort_task() {
            debug!("Restarting discovery");
        }

        let events = self.adapter.discover_devices().await?;
        let adapter = self.adapter.clone();
        let filter = self.name_filter.clone();
        let task = tokio::spawn(async move {
            futures::pin_mut!(events);
            // Name watches are aborted when this set drops with the task.
            let mut naming = JoinSet::new();
            while let Some(event) = events.next().await {
                while naming.try_join_next().is_some() {}
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let device = match adapter.device(address) {
                    Ok(device) => device,
                    Err(e) => {
                        debug!(%address, error = %e, "Device vanished");
                        continue;
                    }
                };
                match device.name().await.ok().flatten() {
                    Some(name) => {
                        if !report_if_matching(&filter, device, &name, &found) {
                            break;
                        }
                    }
                    // The local name often arrives later in a scan response.
                    None => {
                        naming.spawn(report_when_named(device, filter.clone(), found.clone()));
                    }
                }
            }
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        if self.abort_task() {
            debug!("Discovery stopped");
        }
        Ok(())
    }
}

impl Drop for BluezScanner {
    fn drop(&mut self) {
        self.abort_task();
    }
}

/// Report `device` if `name` passes the filter. Returns `false` once the
/// supervisor has gone away.
fn report_if_matching(
    filter: &Regex,
    device: Device,
    name: &str,
    found: &FoundSender<BluezPeripheral>,
) -> bool {
    if !filter.is_match(name) {
        return true;
    }
    let address = device.address();
    debug!(%address, %name, "Matched advertisement");
    found
        .send(DeviceFound {
            identity: DeviceIdentity::new(address.to_string(), device_type(name)),
            peripheral: BluezPeripheral::new(device),
        })
        .is_ok()
}

/// Wait up to [`NAME_WAIT`] for `device` to resolve its name, then filter it.
async fn report_when_named(device: Device, filter: Regex, found: FoundSender<BluezPeripheral>) {
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            debug!(address = %device.address(), error = %e, "Cannot watch device properties");
            return;
        }
    };
    // The name may have landed before the watch was in place.
    let name = match device.name().await.ok().flatten() {
        Some(name) => Some(name),
        None => tokio::time::timeout(NAME_WAIT, first_name(events))
            .await
            .ok()
            .flatten(),
    };
    match name {
        Some(name) => {
            report_if_matching(&filter, device, &name, &found);
        }
        None => debug!(address = %device.address(), "No name resolved"),
    }
}

/// First name announced on a device event stream.
async fn first_name(events: impl Stream<Item = DeviceEvent>) -> Option<String> {
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Name(name)) = event {
            return Some(name);
        }
    }
    None
}

// =============================================================================
// PERIPHERAL
// =============================================================================

/// One SensorTag reached through BlueZ.
pub struct BluezPeripheral {
    device: Device,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    movement_mask: Mutex<u16>,
    movement_feed: tokio::sync::Mutex<Option<broadcast::Sender<Vec<u8>>>>,
}

impl BluezPeripheral {
    fn new(device: Device) -> Self {
        Self {
            device,
            characteristics: Mutex::new(HashMap::new()),
            movement_mask: Mutex::new(0),
            movement_feed: tokio::sync::Mutex::new(None),
        }
    }

    fn characteristic(&self, uuid: Uuid) -> TransportResult<Characteristic> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uuid)
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    async fn write(
        &self,
        uuid: Uuid,
        value: &[u8],
        operation: &'static str,
        kind: SensorKind,
    ) -> TransportResult<()> {
        self.characteristic(uuid)?
            .write(value)
            .await
            .map_err(|e| TransportError::OperationFailed {
                operation,
                kind,
                message: e.to_string(),
            })
    }

    /// Shared notification feed of the movement service.
    async fn movement_feed(&self) -> TransportResult<broadcast::Receiver<Vec<u8>>> {
        let mut feed = self.movement_feed.lock().await;
        if let Some(tx) = feed.as_ref() {
            if tx.receiver_count() > 0 {
                return Ok(tx.subscribe());
            }
        }

        let notifications = self.characteristic(MOVEMENT_DATA)?.notify().await?;
        let (tx, rx) = broadcast::channel(MOVEMENT_FEED_CAPACITY);
        let sender = tx.clone();
        tokio::spawn(async move {
            futures::pin_mut!(notifications);
            while let Some(bytes) = notifications.next().await {
                if sender.send(bytes).is_err() {
                    break;
                }
            }
        });
        *feed = Some(tx);
        Ok(rx)
    }
}

fn broadcast_stream(rx: broadcast::Receiver<Vec<u8>>) -> futures::stream::BoxStream<'static, Vec<u8>> {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(bytes) => return Some((bytes, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Movement subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    async fn connect_and_setup(&self) -> TransportResult<()> {
        let connect_failed = |e: bluer::Error| TransportError::ConnectFailed(e.to_string());

        if !self.device.is_connected().await.map_err(connect_failed)? {
            self.device.connect().await.map_err(connect_failed)?;
        }

        let mut resolved = false;
        for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
            if self.device.is_services_resolved().await.map_err(connect_failed)? {
                resolved = true;
                break;
            }
            tokio::time::sleep(SERVICE_RESOLVE_INTERVAL).await;
        }
        if !resolved {
            return Err(TransportError::ConnectFailed(
                "GATT services were not resolved".into(),
            ));
        }

        let mut characteristics = HashMap::new();
        for service in self.device.services().await.map_err(connect_failed)? {
            for characteristic in service.characteristics().await.map_err(connect_failed)? {
                let uuid = characteristic.uuid().await.map_err(connect_failed)?;
                characteristics.insert(uuid, characteristic);
            }
        }
        debug!(
            device = %self.device.address(),
            count = characteristics.len(),
            "Resolved characteristics"
        );
        *self
            .characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = characteristics;
        Ok(())
    }

    async fn enable(&self, kind: SensorKind) -> TransportResult<()> {
        let Some(config) = profile(kind).config else {
            return Err(TransportError::Unsupported {
                kind,
                operation: "enable",
            });
        };
        if is_movement(kind) {
            let mask = {
                let mut mask = self
                    .movement_mask
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *mask |= movement_bits(kind);
                *mask
            };
            self.write(config, &mask.to_le_bytes(), "enable", kind).await
        } else {
            self.write(config, &[0x01], "enable", kind).await
        }
    }

    async fn set_period(&self, kind: SensorKind, period_ms: u32) -> TransportResult<()> {
        let Some(period) = profile(kind).period else {
            return Err(TransportError::Unsupported {
                kind,
                operation: "set period",
            });
        };
        self.write(period, &[period_register(period_ms)], "set period", kind)
            .await
    }

    async fn subscribe(&self, kind: SensorKind) -> TransportResult<NotificationStream> {
        let failed = |e: TransportError| match e {
            TransportError::CharacteristicNotFound { .. } => e,
            other => TransportError::OperationFailed {
                operation: "subscribe",
                kind,
                message: other.to_string(),
            },
        };

        let bytes = if is_movement(kind) {
            broadcast_stream(self.movement_feed().await.map_err(failed)?)
        } else {
            let characteristic = self.characteristic(profile(kind).data)?;
            characteristic
                .notify()
                .await
                .map_err(|e| failed(e.into()))?
                .boxed()
        };
        Ok(bytes.map(move |payload| decode(kind, &payload)).boxed())
    }

    async fn read_metadata(&self, field: MetadataField) -> TransportResult<String> {
        let bytes = self.characteristic(metadata_uuid(field))?.read().await?;
        Ok(metadata_string(field, &bytes))
    }

    async fn disconnect_signals(&self) -> TransportResult<DisconnectStream> {
        let events = self.device.events().await?;
        Ok(events
            .filter_map(|event| {
                future::ready(matches!(
                    event,
                    DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))
                )
                .then_some(()))
            })
            .boxed())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Err(e) = self.device.disconnect().await {
            warn!(device = %self.device.address(), error = %e, "Disconnect failed");
            return Err(e.into());
        }
        Ok(())
    }
}
