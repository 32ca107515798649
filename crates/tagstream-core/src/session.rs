//! One connected tag: connection, sensor configuration, streaming and
//! teardown.
//!
//! A [`PeripheralSession`] moves strictly forward through
//! [`LifecycleState`]:
//!
//! ```text
//! Discovered -> Connecting -> Configuring -> Streaming -> Disconnecting -> Terminated
//!                    |             |
//!                    +-> Terminated +-> Disconnecting (link dropped mid-configuration)
//! ```
//!
//! Sensor configuration runs enable, set period and subscribe per enabled
//! sensor. A failing step is logged and never aborts the session. Every
//! continuation after an await re-checks the lifecycle state and discards
//! its result once teardown has started.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ResolvedSensors, SensorConfig};
use crate::normalizer::{key_press_messages, normalize};
use crate::registry::SessionRegistry;
use crate::sensor::SensorKind;
use crate::telemetry::{LogRecord, Publisher, TelemetryEvent};
use crate::transport::{DeviceIdentity, MetadataField, NotificationStream, Peripheral, RawReading};

/// Lifecycle of a [`PeripheralSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Found by discovery, not yet connected.
    Discovered,
    /// Connect-and-setup in flight.
    Connecting,
    /// Running the sensor configuration sweep.
    Configuring,
    /// Sweep complete; notifications flow.
    Streaming,
    /// Link dropped; teardown in progress.
    Disconnecting,
    /// Released. Terminal.
    Terminated,
}

impl LifecycleState {
    /// Whether teardown has started.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(self, Self::Disconnecting | Self::Terminated)
    }

    const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Discovered, Self::Connecting)
                | (Self::Connecting, Self::Configuring | Self::Terminated)
                | (Self::Configuring, Self::Streaming)
                | (
                    Self::Discovered | Self::Connecting | Self::Configuring | Self::Streaming,
                    Self::Disconnecting
                )
                | (Self::Disconnecting, Self::Terminated)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-session behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Publish `sensorTagStatus` events on connect and disconnect.
    pub publish_status: bool,
    /// Read device information once after connecting.
    pub read_metadata: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            publish_status: true,
            read_metadata: true,
        }
    }
}

/// Notice sent to the supervisor when a session reaches
/// [`LifecycleState::Terminated`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTerminated {
    /// Device the session belonged to.
    pub identity: DeviceIdentity,
    /// Id of the terminated session.
    pub session_id: Uuid,
}

/// Everything a session needs besides its device.
pub struct SessionContext<P> {
    /// Effective sensor configuration.
    pub sensors: Arc<ResolvedSensors>,
    /// Behaviour switches.
    pub options: SessionOptions,
    /// Telemetry front end.
    pub publisher: Publisher,
    /// Registry the session removes itself from on teardown.
    pub registry: Weak<SessionRegistry<P>>,
    /// Where termination notices go.
    pub terminated: mpsc::UnboundedSender<SessionTerminated>,
}

impl<P> Clone for SessionContext<P> {
    fn clone(&self) -> Self {
        Self {
            sensors: Arc::clone(&self.sensors),
            options: self.options,
            publisher: self.publisher.clone(),
            registry: Weak::clone(&self.registry),
            terminated: self.terminated.clone(),
        }
    }
}

/// The software side of one connected tag.
pub struct PeripheralSession<P> {
    id: Uuid,
    identity: DeviceIdentity,
    peripheral: P,
    ctx: SessionContext<P>,
    state: watch::Sender<LifecycleState>,
    subscriptions: Mutex<HashMap<SensorKind, JoinHandle<()>>>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
}

impl<P> fmt::Debug for PeripheralSession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<P: Peripheral> PeripheralSession<P> {
    /// Create a session in [`LifecycleState::Discovered`].
    pub fn new(identity: DeviceIdentity, peripheral: P, ctx: SessionContext<P>) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Discovered);
        Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            peripheral,
            ctx,
            state,
            subscriptions: Mutex::new(HashMap::new()),
            connected_at: Mutex::new(None),
        })
    }

    /// Unique id of this session instance.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Device this session belongs to.
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// When the connection was established.
    #[must_use]
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self
            .connected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sensors with a live subscription, sorted.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SensorKind> {
        let mut kinds: Vec<_> = self.lock_subscriptions().keys().copied().collect();
        kinds.sort();
        kinds
    }

    fn is_closing(&self) -> bool {
        self.state().is_closing()
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<SensorKind, JoinHandle<()>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the transition is legal from the current state.
    fn transition(&self, next: LifecycleState) -> bool {
        let mut from = None;
        let moved = self.state.send_if_modified(|state| {
            if state.can_become(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            debug!(device = %self.identity, %from, to = %next, "Session transition");
        }
        moved
    }

    /// Drive the session from Discovered to Streaming.
    ///
    /// Returns once configuration is complete or the session has terminated;
    /// notification handling continues on background tasks.
    pub async fn run(self: Arc<Self>) {
        if !self.transition(LifecycleState::Connecting) {
            return;
        }

        let connected = self.peripheral.connect_and_setup().await;
        if self.is_closing() {
            // Torn down while connecting; do not leave the link up.
            if connected.is_ok() {
                if let Err(e) = self.peripheral.disconnect().await {
                    debug!(device = %self.identity, error = %e, "Disconnect after teardown failed");
                }
            }
            return;
        }

        if let Err(e) = connected {
            warn!(device = %self.identity, error = %e, "Connect failed");
            self.ctx
                .publisher
                .log(LogRecord::error(e.to_string()).with_data(self.identity_data()))
                .await;
            if self.transition(LifecycleState::Terminated) {
                self.release();
            }
            return;
        }

        if !self.transition(LifecycleState::Configuring) {
            return;
        }
        *self
            .connected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        info!(device = %self.identity, "Connected");
        self.ctx
            .publisher
            .log(LogRecord::info("connectAndSetUp.").with_data(self.identity_data()))
            .await;

        if !self.watch_disconnects().await {
            // A link whose loss cannot be observed would never be released.
            self.close().await;
            return;
        }

        if self.ctx.options.read_metadata {
            self.read_metadata().await;
        }

        let sensors = Arc::clone(&self.ctx.sensors);
        for (kind, config) in sensors.enabled() {
            if self.is_closing() {
                return;
            }
            self.configure_sensor(kind, config).await;
        }

        if !self.transition(LifecycleState::Streaming) {
            return;
        }
        info!(
            device = %self.identity,
            sensors = ?self.active_subscriptions(),
            "Streaming"
        );
        if self.ctx.options.publish_status {
            self.ctx.publisher.event(TelemetryEvent::status(true)).await;
        }
    }

    /// Handle a disconnect signal from the transport.
    ///
    /// Only the first call tears the session down; later calls are no-ops.
    pub async fn handle_disconnect(&self) {
        if !self.transition(LifecycleState::Disconnecting) {
            return;
        }
        info!(device = %self.identity, "Disconnected");
        self.ctx
            .publisher
            .log(LogRecord::info("Sensortag disconnected.").with_data(self.identity_data()))
            .await;
        if self.ctx.options.publish_status {
            self.ctx.publisher.event(TelemetryEvent::status(false)).await;
        }
        if self.transition(LifecycleState::Terminated) {
            self.release();
        }
    }

    /// Drop the link and tear the session down.
    pub async fn close(&self) {
        if self.is_closing() {
            return;
        }
        if let Err(e) = self.peripheral.disconnect().await {
            debug!(device = %self.identity, error = %e, "Disconnect request failed");
        }
        self.handle_disconnect().await;
    }

    /// Release subscriptions, leave the registry and tell the supervisor.
    fn release(&self) {
        // Pump tasks watch the state and exit on their own, which lets an
        // in-flight publish finish.
        let released: Vec<_> = self.lock_subscriptions().drain().map(|(kind, _)| kind).collect();
        if !released.is_empty() {
            debug!(device = %self.identity, sensors = ?released, "Released subscriptions");
        }

        if let Some(registry) = self.ctx.registry.upgrade() {
            registry.unregister_session(&self.identity, self.id);
        }

        let notice = SessionTerminated {
            identity: self.identity.clone(),
            session_id: self.id,
        };
        if self.ctx.terminated.send(notice).is_err() {
            debug!(device = %self.identity, "Supervisor gone; termination not reported");
        }
    }

    /// Spawn the disconnect watcher. Returns `false` if the transport cannot
    /// report disconnects.
    async fn watch_disconnects(self: &Arc<Self>) -> bool {
        let mut signals = match self.peripheral.disconnect_signals().await {
            Ok(signals) => signals,
            Err(e) => {
                warn!(device = %self.identity, error = %e, "Cannot watch for disconnects");
                self.ctx
                    .publisher
                    .log(
                        LogRecord::error("Could not watch for disconnect.")
                            .with_data(json!({ "id": self.identity.id, "error": e.to_string() })),
                    )
                    .await;
                return false;
            }
        };

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let closed = closed(session.watch_state());
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    biased;
                    () = &mut closed => break,
                    signal = signals.next() => match signal {
                        Some(()) => session.handle_disconnect().await,
                        None => break,
                    },
                }
            }
        });
        true
    }

    async fn read_metadata(&self) {
        let mut fields = Map::new();
        for field in MetadataField::ALL {
            let result = self.peripheral.read_metadata(field).await;
            if self.is_closing() {
                return;
            }
            match result {
                Ok(value) => {
                    fields.insert(field.as_str().to_string(), Value::String(value));
                }
                Err(e) => {
                    self.ctx
                        .publisher
                        .log(
                            LogRecord::error(format!("Could not read {field}."))
                                .with_data(json!({ "error": e.to_string() })),
                        )
                        .await;
                }
            }
        }
        if !fields.is_empty() {
            fields.insert("id".to_string(), Value::String(self.identity.id.clone()));
            self.ctx
                .publisher
                .log(LogRecord::info("Sensortag metadata.").with_data(Value::Object(fields)))
                .await;
        }
    }

    /// Enable, set the period of and subscribe to one sensor.
    async fn configure_sensor(self: &Arc<Self>, kind: SensorKind, config: SensorConfig) {
        let caps = kind.descriptor().capabilities;
        let publisher = &self.ctx.publisher;

        if caps.enable {
            let result = self.peripheral.enable(kind).await;
            if self.is_closing() {
                return;
            }
            if let Err(e) = result {
                warn!(device = %self.identity, sensor = %kind, error = %e, "Enable failed");
                publisher
                    .log(
                        LogRecord::error(format!("Could not enable {kind}."))
                            .with_data(json!({ "sensor": kind.as_str(), "error": e.to_string() })),
                    )
                    .await;
                return;
            }
        }

        if caps.set_period {
            let period = config.period_ms;
            let result = self.peripheral.set_period(kind, period).await;
            if self.is_closing() {
                return;
            }
            match result {
                Ok(()) => {
                    publisher
                        .log(
                            LogRecord::info(format!("Set {kind} period."))
                                .with_data(json!({ "sensor": kind.as_str(), "period": period })),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(
                        device = %self.identity,
                        sensor = %kind,
                        period_ms = period,
                        error = %e,
                        "Set period failed"
                    );
                    publisher
                        .log(
                            LogRecord::error(format!("Error setting {kind} period."))
                                .with_data(json!({
                                    "sensor": kind.as_str(),
                                    "error": e.to_string(),
                                    "period": period,
                                })),
                        )
                        .await;
                }
            }
        }

        if caps.subscribe {
            let result = self.peripheral.subscribe(kind).await;
            if self.is_closing() {
                return;
            }
            match result {
                Ok(stream) => {
                    self.attach(kind, stream);
                    if kind == SensorKind::SimpleKey {
                        publisher.log(LogRecord::info("simpleKeyChange enabled.")).await;
                    }
                }
                Err(e) => {
                    warn!(device = %self.identity, sensor = %kind, error = %e, "Subscribe failed");
                    publisher
                        .log(
                            LogRecord::error(format!("Error setting notify {kind}."))
                                .with_data(json!({ "sensor": kind.as_str(), "error": e.to_string() })),
                        )
                        .await;
                }
            }
        }
    }

    /// Start the notification pump for `kind` and track its handle.
    fn attach(self: &Arc<Self>, kind: SensorKind, stream: NotificationStream) {
        let mut subscriptions = self.lock_subscriptions();
        // Checked under the lock: release() drains the map only after the
        // state has moved, so a handle inserted here is always released.
        if self.is_closing() {
            return;
        }
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.pump(kind, stream).await });
        if let Some(previous) = subscriptions.insert(kind, handle) {
            previous.abort();
        }
    }

    async fn pump(self: Arc<Self>, kind: SensorKind, mut stream: NotificationStream) {
        let closed = closed(self.watch_state());
        tokio::pin!(closed);
        loop {
            let raw = tokio::select! {
                biased;
                () = &mut closed => break,
                next = stream.next() => match next {
                    Some(raw) => raw,
                    None => break,
                },
            };
            if self.is_closing() {
                break;
            }
            self.publish_reading(kind, &raw).await;
        }
        debug!(device = %self.identity, sensor = %kind, "Notification pump stopped");
    }

    async fn publish_reading(&self, kind: SensorKind, raw: &RawReading) {
        if kind == SensorKind::SimpleKey {
            for message in key_press_messages(raw) {
                self.ctx.publisher.log(LogRecord::info(message)).await;
            }
        }
        for event in normalize(kind, raw) {
            self.ctx.publisher.event(event).await;
        }
    }

    fn identity_data(&self) -> Value {
        json!({ "id": self.identity.id, "type": self.identity.device_type })
    }
}

/// Resolves once the watched session starts closing.
async fn closed(mut state: watch::Receiver<LifecycleState>) {
    loop {
        let closing = state.borrow_and_update().is_closing();
        if closing || state.changed().await.is_err() {
            return;
        }
    }
}
