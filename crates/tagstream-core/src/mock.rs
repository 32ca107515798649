//! Scripted in-memory transport and sink for tests.
//!
//! [`MockPeripheral`] records every call and can be told to fail or block
//! individual steps. [`MockScanner`] delivers devices only while scanning.
//! [`MemorySink`] keeps everything published to it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Notify};

use crate::config::{resolve, SensorOptions};
use crate::error::{PublishError, TransportError, TransportResult};
use crate::registry::SessionRegistry;
use crate::sensor::SensorKind;
use crate::session::{PeripheralSession, SessionContext, SessionOptions};
use crate::telemetry::{LogLevel, LogRecord, Publisher, TelemetryEvent, TelemetrySink};
use crate::transport::{
    DeviceFound, DeviceIdentity, DisconnectStream, FoundSender, MetadataField,
    NotificationStream, Peripheral, RawReading, Scanner,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A per-sensor configuration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    /// [`Peripheral::enable`].
    Enable,
    /// [`Peripheral::set_period`].
    SetPeriod,
    /// [`Peripheral::subscribe`].
    Subscribe,
}

impl MockStep {
    const fn operation(self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::SetPeriod => "set period",
            Self::Subscribe => "subscribe",
        }
    }
}

/// A call received by a [`MockPeripheral`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    /// `connect_and_setup`.
    Connect,
    /// `enable`.
    Enable(SensorKind),
    /// `set_period`.
    SetPeriod(SensorKind, u32),
    /// `subscribe`.
    Subscribe(SensorKind),
    /// `read_metadata`.
    ReadMetadata(MetadataField),
    /// `disconnect_signals`.
    DisconnectSignals,
    /// `disconnect`.
    Disconnect,
}

#[derive(Default)]
struct PeripheralState {
    calls: Vec<MockCall>,
    connect_failure: Option<String>,
    disconnect_signals_failure: Option<String>,
    failures: HashMap<(MockStep, SensorKind), String>,
    holds: HashMap<(MockStep, SensorKind), Arc<Notify>>,
    metadata: HashMap<MetadataField, String>,
    metadata_failures: HashSet<MetadataField>,
    notifiers: HashMap<SensorKind, mpsc::UnboundedSender<RawReading>>,
    disconnect_listeners: Vec<mpsc::UnboundedSender<()>>,
}

/// Scripted [`Peripheral`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockPeripheral {
    state: Arc<Mutex<PeripheralState>>,
}

impl MockPeripheral {
    /// A peripheral where every step succeeds and metadata reads return
    /// CC2650 values.
    #[must_use]
    pub fn new() -> Self {
        let peripheral = Self::default();
        lock(&peripheral.state).metadata = [
            (MetadataField::DeviceName, "CC2650 SensorTag"),
            (MetadataField::SystemId, "b0b448fffec2a9c4"),
            (MetadataField::SerialNumber, "N.A."),
            (MetadataField::FirmwareRevision, "1.30 (Jun 13 2016)"),
            (MetadataField::HardwareRevision, "PCB 1.2/1.3"),
            (MetadataField::SoftwareRevision, "N.A."),
            (MetadataField::ManufacturerName, "Texas Instruments"),
        ]
        .into_iter()
        .map(|(field, value)| (field, value.to_string()))
        .collect();
        peripheral
    }

    /// Make `connect_and_setup` fail.
    pub fn fail_connect(&self, message: &str) {
        lock(&self.state).connect_failure = Some(message.to_string());
    }

    /// Make `disconnect_signals` fail.
    pub fn fail_disconnect_signals(&self, message: &str) {
        lock(&self.state).disconnect_signals_failure = Some(message.to_string());
    }

    /// Make `step` fail for `kind`.
    pub fn fail(&self, step: MockStep, kind: SensorKind, message: &str) {
        lock(&self.state)
            .failures
            .insert((step, kind), message.to_string());
    }

    /// Block `step` for `kind` until the returned handle is notified.
    #[must_use]
    pub fn hold(&self, step: MockStep, kind: SensorKind) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.state).holds.insert((step, kind), gate.clone());
        gate
    }

    /// Make reads of `field` fail.
    pub fn fail_metadata(&self, field: MetadataField) {
        lock(&self.state).metadata_failures.insert(field);
    }

    /// Push a notification for `kind`. Returns `false` if nothing is
    /// subscribed.
    pub fn notify(&self, kind: SensorKind, reading: RawReading) -> bool {
        lock(&self.state)
            .notifiers
            .get(&kind)
            .is_some_and(|tx| tx.send(reading).is_ok())
    }

    /// Whether a live subscription exists for `kind`.
    #[must_use]
    pub fn is_subscribed(&self, kind: SensorKind) -> bool {
        lock(&self.state)
            .notifiers
            .get(&kind)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Emit a disconnect signal.
    pub fn signal_disconnect(&self) {
        lock(&self.state)
            .disconnect_listeners
            .retain(|tx| tx.send(()).is_ok());
    }

    /// Every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    /// Record `call`, wait on any hold and return the scripted failure.
    async fn step(&self, call: MockCall, step: MockStep, kind: SensorKind) -> TransportResult<()> {
        let gate = {
            let mut state = lock(&self.state);
            state.calls.push(call);
            state.holds.get(&(step, kind)).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match lock(&self.state).failures.get(&(step, kind)) {
            Some(message) => Err(TransportError::OperationFailed {
                operation: step.operation(),
                kind,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    async fn connect_and_setup(&self) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::Connect);
        match &state.connect_failure {
            Some(message) => Err(TransportError::ConnectFailed(message.clone())),
            None => Ok(()),
        }
    }

    async fn enable(&self, kind: SensorKind) -> TransportResult<()> {
        self.step(MockCall::Enable(kind), MockStep::Enable, kind)
            .await
    }

    async fn set_period(&self, kind: SensorKind, period_ms: u32) -> TransportResult<()> {
        self.step(MockCall::SetPeriod(kind, period_ms), MockStep::SetPeriod, kind)
            .await
    }

    async fn subscribe(&self, kind: SensorKind) -> TransportResult<NotificationStream> {
        self.step(MockCall::Subscribe(kind), MockStep::Subscribe, kind)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).notifiers.insert(kind, tx);
        Ok(receiver_stream(rx))
    }

    async fn read_metadata(&self, field: MetadataField) -> TransportResult<String> {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::ReadMetadata(field));
        if state.metadata_failures.contains(&field) {
            return Err(TransportError::Backend(format!("{field} not readable")));
        }
        state
            .metadata
            .get(&field)
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicNotFound {
                uuid: field.to_string(),
            })
    }

    async fn disconnect_signals(&self) -> TransportResult<DisconnectStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.calls.push(MockCall::DisconnectSignals);
        if let Some(message) = &state.disconnect_signals_failure {
            return Err(TransportError::Backend(message.clone()));
        }
        state.disconnect_listeners.push(tx);
        Ok(receiver_stream(rx))
    }

    async fn disconnect(&self) -> TransportResult<()> {
        lock(&self.state).calls.push(MockCall::Disconnect);
        Ok(())
    }
}

fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> futures::stream::BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

#[derive(Default)]
struct ScannerState {
    found: Option<FoundSender<MockPeripheral>>,
    scanning: bool,
    starts: usize,
    stops: usize,
    start_failure: Option<String>,
}

/// Scripted [`Scanner`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockScanner {
    state: Arc<Mutex<ScannerState>>,
}

impl MockScanner {
    /// An idle scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `start_discovery` fail.
    pub fn fail_start(&self, message: &str) {
        lock(&self.state).start_failure = Some(message.to_string());
    }

    /// Report a device. Returns `false` if discovery is not running.
    pub fn report(&self, identity: DeviceIdentity, peripheral: MockPeripheral) -> bool {
        let state = lock(&self.state);
        match &state.found {
            Some(found) if state.scanning => found
                .send(DeviceFound {
                    identity,
                    peripheral,
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Whether discovery is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    /// Number of `start_discovery` calls.
    #[must_use]
    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    /// Number of `stop_discovery` calls.
    #[must_use]
    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }
}

#[async_trait]
impl Scanner for MockScanner {
    type Peripheral = MockPeripheral;

    async fn start_discovery(&self, found: FoundSender<MockPeripheral>) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.starts += 1;
        if let Some(message) = &state.start_failure {
            return Err(TransportError::Backend(message.clone()));
        }
        state.found = Some(found);
        state.scanning = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.scanning = false;
        Ok(())
    }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    logs: Mutex<Vec<LogRecord>>,
    events: Mutex<Vec<TelemetryEvent>>,
    failing: AtomicBool,
}

impl MemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every record while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Log records received so far.
    #[must_use]
    pub fn logs(&self) -> Vec<LogRecord> {
        lock(&self.logs).clone()
    }

    /// Log records at `level`.
    #[must_use]
    pub fn logs_at(&self, level: LogLevel) -> Vec<LogRecord> {
        lock(&self.logs)
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Whether a log record with exactly `message` was received.
    #[must_use]
    pub fn has_log(&self, message: &str) -> bool {
        lock(&self.logs).iter().any(|r| r.message == message)
    }

    /// Events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        lock(&self.events).clone()
    }

    /// Events called `name`.
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<TelemetryEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// Whether an event called `name` was received.
    #[must_use]
    pub fn has_event(&self, name: &str) -> bool {
        lock(&self.events).iter().any(|e| e.name == name)
    }

    fn check(&self) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("memory sink set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn publish_log(&self, record: &LogRecord) -> Result<(), PublishError> {
        self.check()?;
        lock(&self.logs).push(record.clone());
        Ok(())
    }

    async fn publish_event(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        self.check()?;
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// An unregistered session bound to `registry`, with no sensors enabled
/// and a throwaway sink.
#[must_use]
pub fn test_session(
    registry: &Arc<SessionRegistry<MockPeripheral>>,
    identity: DeviceIdentity,
    peripheral: MockPeripheral,
) -> Arc<PeripheralSession<MockPeripheral>> {
    let (terminated, _) = mpsc::unbounded_channel();
    let ctx = SessionContext {
        sensors: Arc::new(resolve(&SensorOptions::none(), false)),
        options: SessionOptions::default(),
        publisher: Publisher::new(Arc::new(MemorySink::new())),
        registry: Arc::downgrade(registry),
        terminated,
    };
    PeripheralSession::new(identity, peripheral, ctx)
}
