//! Discovery supervision.
//!
//! The [`Supervisor`] owns the scanner and the [`SessionRegistry`]. It turns
//! discovery reports into sessions, restarts discovery when sessions end and
//! closes everything on shutdown. Scan behaviour follows [`ScanMode`]:
//!
//! | Mode           | Device accepted      | Session terminated |
//! |----------------|----------------------|--------------------|
//! | `continuous`   | keep scanning        | restart scan       |
//! | `stop-on-find` | stop scan            | restart scan       |
//! | `single-shot`  | stop scan for good   | nothing            |

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, ResolvedSensors, ScanMode};
use crate::error::{Result, TagstreamError};
use crate::registry::SessionRegistry;
use crate::session::{PeripheralSession, SessionContext, SessionOptions, SessionTerminated};
use crate::telemetry::{LogRecord, Publisher};
use crate::transport::{DeviceFound, DeviceIdentity, FoundSender, Scanner};

type Session<S> = PeripheralSession<<S as Scanner>::Peripheral>;
type FoundReceiver<S> = mpsc::UnboundedReceiver<DeviceFound<<S as Scanner>::Peripheral>>;

/// Settings the supervisor runs with.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Scan mode.
    pub mode: ScanMode,
    /// Accepted addresses; everything when empty.
    pub allowed_devices: Vec<String>,
    /// Effective sensor configuration shared by every session.
    pub sensors: ResolvedSensors,
    /// Per-session switches.
    pub session: SessionOptions,
}

impl SupervisorConfig {
    /// Derive supervisor settings from the application config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.scan.mode,
            allowed_devices: config.scan.allowed_devices.clone(),
            sensors: config.resolved_sensors(),
            session: SessionOptions {
                publish_status: config.telemetry.publish_status,
                read_metadata: config.session.read_metadata,
            },
        }
    }
}

/// Discovery loop and session owner.
pub struct Supervisor<S: Scanner> {
    scanner: Arc<S>,
    registry: Arc<SessionRegistry<S::Peripheral>>,
    ctx: SessionContext<S::Peripheral>,
    mode: ScanMode,
    allowed: HashSet<String>,
    found_tx: FoundSender<S::Peripheral>,
    found_rx: Mutex<Option<FoundReceiver<S>>>,
    terminated_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionTerminated>>>,
    stopping: AtomicBool,
    retired: AtomicBool,
    // Serializes scanner start/stop so a late restart cannot outrun shutdown.
    scan_control: tokio::sync::Mutex<()>,
}

impl<S: Scanner> Supervisor<S> {
    /// Create a supervisor. Nothing happens until [`run`](Self::run).
    pub fn new(scanner: S, config: SupervisorConfig, publisher: Publisher) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let (found_tx, found_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            sensors: Arc::new(config.sensors),
            options: config.session,
            publisher,
            registry: Arc::downgrade(&registry),
            terminated: terminated_tx,
        };
        Arc::new(Self {
            scanner: Arc::new(scanner),
            registry,
            ctx,
            mode: config.mode,
            allowed: config
                .allowed_devices
                .iter()
                .map(|addr| addr.to_ascii_uppercase())
                .collect(),
            found_tx,
            found_rx: Mutex::new(Some(found_rx)),
            terminated_rx: Mutex::new(Some(terminated_rx)),
            stopping: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            scan_control: tokio::sync::Mutex::new(()),
        })
    }

    /// Active sessions.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry<S::Peripheral>> {
        &self.registry
    }

    /// The scanner being driven.
    #[must_use]
    pub const fn scanner(&self) -> &Arc<S> {
        &self.scanner
    }

    fn is_allowed(&self, identity: &DeviceIdentity) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&identity.id.to_ascii_uppercase())
    }

    /// Handle one discovery report.
    ///
    /// Returns the new session if the device was accepted. Safe to call
    /// concurrently: at most one call per identity creates a session. Only
    /// the registry is touched here; stopping the scan, the announcement and
    /// the session itself run on a spawned task.
    pub fn on_device_found(
        self: &Arc<Self>,
        identity: DeviceIdentity,
        peripheral: S::Peripheral,
    ) -> Option<Arc<Session<S>>> {
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }
        if !self.is_allowed(&identity) {
            debug!(device = %identity, "Ignoring device outside allowlist");
            return None;
        }
        if self.registry.lookup(&identity).is_some() {
            debug!(device = %identity, "Ignoring device with active session");
            return None;
        }
        if self.mode == ScanMode::SingleShot && self.retired.swap(true, Ordering::SeqCst) {
            debug!(device = %identity, "Single-shot scan already accepted a device");
            return None;
        }

        let session = PeripheralSession::new(identity.clone(), peripheral, self.ctx.clone());
        if let Err(e) = self.registry.register(identity.clone(), session.clone()) {
            debug!(error = %e, "Lost registration race");
            return None;
        }

        info!(device = %identity, session = %session.id(), "Device discovered");
        let announcement = LogRecord::info("Sensortag discovered.")
            .with_data(json!({ "id": identity.id, "type": identity.device_type }));
        let supervisor = Arc::clone(self);
        let started = Arc::clone(&session);
        tokio::spawn(async move {
            // Stopped before the session runs, so a restart triggered by its
            // termination always comes after.
            if supervisor.mode.stops_on_find() {
                supervisor.stop_scan().await;
            }
            supervisor.ctx.publisher.log(announcement).await;
            started.run().await;
        });
        Some(session)
    }

    /// Handle a session reaching the end of its lifecycle.
    ///
    /// Discovery is restarted on a spawned task.
    pub fn on_session_terminated(self: &Arc<Self>, notice: SessionTerminated) {
        self.registry
            .unregister_session(&notice.identity, notice.session_id);
        debug!(device = %notice.identity, session = %notice.session_id, "Session ended");

        if self.stopping.load(Ordering::SeqCst) || !self.mode.rearms_on_termination() {
            return;
        }
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.restart_scan().await });
    }

    async fn stop_scan(&self) {
        let _guard = self.scan_control.lock().await;
        if let Err(e) = self.scanner.stop_discovery().await {
            warn!(error = %e, "Failed to stop discovery");
        }
    }

    async fn restart_scan(&self) {
        let _guard = self.scan_control.lock().await;
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        info!("Restarting discovery");
        if let Err(e) = self.scanner.start_discovery(self.found_tx.clone()).await {
            warn!(error = %e, "Failed to restart discovery");
        }
    }

    /// Run discovery until `shutdown` resolves, then close every session.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery cannot be started, or if the
    /// supervisor is already running.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let (Some(mut found), Some(mut terminated)) = (
            self.found_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
            self.terminated_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        ) else {
            return Err(TagstreamError::AlreadyRunning);
        };

        self.scanner.start_discovery(self.found_tx.clone()).await?;
        info!(mode = ?self.mode, "Scanning for devices");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(DeviceFound { identity, peripheral }) = found.recv() => {
                    self.on_device_found(identity, peripheral);
                }
                Some(notice) = terminated.recv() => {
                    self.on_session_terminated(notice);
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop discovery and close every session.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(sessions = self.registry.len(), "Shutting down");
        self.stop_scan().await;
        for session in self.registry.sessions() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, SensorOptions, SensorOverride};
    use crate::error::{PublishError, TransportError};
    use crate::mock::{wait_until, MemorySink, MockCall, MockPeripheral, MockScanner, MockStep};
    use crate::sensor::SensorKind;
    use crate::session::LifecycleState;
    use crate::telemetry::{LogLevel, TelemetryEvent, TelemetrySink};
    use crate::transport::RawReading;
    use std::time::Duration;
    use tokio::sync::oneshot;

    const TAG: &str = "AA:BB:CC:DD:EE:FF";

    fn tag() -> DeviceIdentity {
        DeviceIdentity::new(TAG, "cc2650")
    }

    fn settings(mode: ScanMode, sensors: &[SensorKind]) -> SupervisorConfig {
        let mut options = SensorOptions::none();
        for &kind in sensors {
            options.set(kind, Some(SensorOverride::default()));
        }
        SupervisorConfig {
            mode,
            allowed_devices: Vec::new(),
            sensors: resolve(&options, false),
            session: SessionOptions {
                publish_status: true,
                read_metadata: false,
            },
        }
    }

    struct Running {
        supervisor: Arc<Supervisor<MockScanner>>,
        scanner: MockScanner,
        sink: Arc<MemorySink>,
        stop: Option<oneshot::Sender<()>>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    impl Running {
        async fn start(config: SupervisorConfig) -> Self {
            let scanner = MockScanner::new();
            let sink = Arc::new(MemorySink::new());
            let supervisor =
                Supervisor::new(scanner.clone(), config, Publisher::new(sink.clone()));
            let (stop, stopped) = oneshot::channel::<()>();
            let task = tokio::spawn(supervisor.clone().run(async move {
                let _ = stopped.await;
            }));
            assert!(wait_until(|| scanner.is_scanning()).await);
            Self {
                supervisor,
                scanner,
                sink,
                stop: Some(stop),
                task,
            }
        }

        async fn streaming_session(&self) -> Arc<PeripheralSession<MockPeripheral>> {
            assert!(wait_until(|| self.supervisor.registry().lookup(&tag()).is_some()).await);
            let session = self.supervisor.registry().lookup(&tag()).unwrap();
            let mut state = session.watch_state();
            tokio::time::timeout(
                Duration::from_secs(2),
                state.wait_for(|s| *s == LifecycleState::Streaming),
            )
            .await
            .unwrap()
            .unwrap();
            session
        }

        async fn stop(mut self) -> Result<()> {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.task.await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_duplicate_find_while_streaming_is_ignored() {
        let running = Running::start(settings(ScanMode::Continuous, &[SensorKind::Luxometer])).await;
        let first = MockPeripheral::new();
        assert!(running.scanner.report(tag(), first.clone()));
        let session = running.streaming_session().await;

        let second = MockPeripheral::new();
        assert!(running.scanner.report(tag(), second.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(running.supervisor.registry().len(), 1);
        assert_eq!(
            running.supervisor.registry().lookup(&tag()).unwrap().id(),
            session.id()
        );
        assert!(second.calls().is_empty());
        assert_eq!(
            first.calls().iter().filter(|c| **c == MockCall::Connect).count(),
            1
        );
        assert_eq!(
            running
                .sink
                .logs()
                .iter()
                .filter(|l| l.message == "Sensortag discovered.")
                .count(),
            1
        );
        running.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_finds_create_one_session() {
        let supervisor = Supervisor::new(
            MockScanner::new(),
            settings(ScanMode::Continuous, &[]),
            Publisher::new(Arc::new(MemorySink::new())),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let supervisor = supervisor.clone();
            handles.push(tokio::spawn(async move {
                supervisor
                    .on_device_found(tag(), MockPeripheral::new())
                    .is_some()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(supervisor.registry().len(), 1);
    }

    /// Sink whose log publishes take far longer than the test waits.
    struct StalledSink;

    #[async_trait::async_trait]
    impl TelemetrySink for StalledSink {
        async fn publish_log(&self, _record: &LogRecord) -> std::result::Result<(), PublishError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn publish_event(&self, _event: &TelemetryEvent) -> std::result::Result<(), PublishError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_sink_does_not_hold_up_finds() {
        let scanner = MockScanner::new();
        let supervisor = Supervisor::new(
            scanner.clone(),
            settings(ScanMode::Continuous, &[SensorKind::Luxometer]),
            Publisher::new(Arc::new(StalledSink)),
        );
        let _task = tokio::spawn(supervisor.clone().run(std::future::pending()));
        assert!(wait_until(|| scanner.is_scanning()).await);

        for id in ["AA:00:00:00:00:01", "AA:00:00:00:00:02", "AA:00:00:00:00:03"] {
            assert!(scanner.report(DeviceIdentity::new(id, "cc2650"), MockPeripheral::new()));
        }
        assert!(wait_until(|| supervisor.registry().len() == 3).await);
    }

    #[tokio::test]
    async fn test_continuous_scan_rearms_after_disconnect() {
        let running = Running::start(settings(ScanMode::Continuous, &[SensorKind::Luxometer])).await;
        let peripheral = MockPeripheral::new();
        running.scanner.report(tag(), peripheral.clone());
        running.streaming_session().await;
        assert!(running.scanner.is_scanning());
        assert_eq!(running.scanner.stops(), 0);

        peripheral.signal_disconnect();
        assert!(wait_until(|| running.scanner.starts() == 2).await);
        assert!(running.supervisor.registry().is_empty());

        // The same device is accepted again once it reappears.
        let again = MockPeripheral::new();
        assert!(running.scanner.report(tag(), again.clone()));
        running.streaming_session().await;
        assert_eq!(again.calls()[0], MockCall::Connect);
        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_on_find_stops_then_rearms() {
        let running = Running::start(settings(ScanMode::StopOnFind, &[SensorKind::Luxometer])).await;
        let peripheral = MockPeripheral::new();
        running.scanner.report(tag(), peripheral.clone());
        running.streaming_session().await;
        assert!(!running.scanner.is_scanning());
        assert_eq!(running.scanner.stops(), 1);

        peripheral.signal_disconnect();
        assert!(wait_until(|| running.scanner.is_scanning()).await);
        assert_eq!(running.scanner.starts(), 2);
        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_shot_never_rearms() {
        let running = Running::start(settings(ScanMode::SingleShot, &[SensorKind::Luxometer])).await;
        let peripheral = MockPeripheral::new();
        running.scanner.report(tag(), peripheral.clone());
        running.streaming_session().await;
        assert!(!running.scanner.is_scanning());

        peripheral.signal_disconnect();
        assert!(wait_until(|| running.supervisor.registry().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(running.scanner.starts(), 1);
        assert!(!running.scanner.is_scanning());

        let late = running
            .supervisor
            .on_device_found(DeviceIdentity::new("11:22:33:44:55:66", "cc2650"), MockPeripheral::new());
        assert!(late.is_none());
        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_allowlist_filters_devices() {
        let mut config = settings(ScanMode::Continuous, &[]);
        config.allowed_devices = vec![TAG.to_string()];
        let supervisor = Supervisor::new(
            MockScanner::new(),
            config,
            Publisher::new(Arc::new(MemorySink::new())),
        );

        let stranger = supervisor
            .on_device_found(DeviceIdentity::new("11:22:33:44:55:66", "cc2650"), MockPeripheral::new());
        assert!(stranger.is_none());

        let known = supervisor
            .on_device_found(DeviceIdentity::new("aa:bb:cc:dd:ee:ff", "cc2650"), MockPeripheral::new());
        assert!(known.is_some());
    }

    #[tokio::test]
    async fn test_busy_humidity_period_still_streams() {
        let running = Running::start(settings(ScanMode::Continuous, &[SensorKind::Humidity])).await;
        let peripheral = MockPeripheral::new();
        peripheral.fail(MockStep::SetPeriod, SensorKind::Humidity, "busy");
        running.scanner.report(tag(), peripheral.clone());
        running.streaming_session().await;

        let errors = running.sink.logs_at(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Error setting humidity period.");

        assert!(peripheral.notify(SensorKind::Humidity, RawReading::new(&[21.46, 55.55])));
        assert!(wait_until(|| running.sink.has_event("humidity")).await);
        let names: Vec<_> = running
            .sink
            .events()
            .into_iter()
            .map(|e| e.name)
            .filter(|n| n != "sensorTagStatus")
            .collect();
        assert_eq!(names, ["humidityTemperature", "humidity"]);
        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_rearms_discovery() {
        let running = Running::start(settings(ScanMode::StopOnFind, &[SensorKind::Luxometer])).await;
        let peripheral = MockPeripheral::new();
        peripheral.fail_connect("page timeout");
        running.scanner.report(tag(), peripheral);

        assert!(wait_until(|| running.scanner.starts() == 2).await);
        assert!(running.supervisor.registry().is_empty());
        assert!(running.scanner.is_scanning());
        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let running = Running::start(settings(ScanMode::Continuous, &[SensorKind::Luxometer])).await;
        let peripheral = MockPeripheral::new();
        running.scanner.report(tag(), peripheral.clone());
        let session = running.streaming_session().await;
        let scanner = running.scanner.clone();
        let supervisor = running.supervisor.clone();

        running.stop().await.unwrap();

        assert_eq!(session.state(), LifecycleState::Terminated);
        assert!(supervisor.registry().is_empty());
        assert!(!scanner.is_scanning());
        assert!(peripheral.calls().contains(&MockCall::Disconnect));
        assert_eq!(scanner.starts(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_returned() {
        let scanner = MockScanner::new();
        scanner.fail_start("adapter missing");
        let supervisor = Supervisor::new(
            scanner,
            settings(ScanMode::Continuous, &[]),
            Publisher::new(Arc::new(MemorySink::new())),
        );
        let err = supervisor
            .clone()
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TagstreamError::Transport(TransportError::Backend(ref message)) if message == "adapter missing"
        ));

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, TagstreamError::AlreadyRunning));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.telemetry.publish_status = false;
        config.session.read_metadata = false;
        config.scan.mode = ScanMode::SingleShot;
        let settings = SupervisorConfig::from_config(&config);
        assert_eq!(settings.mode, ScanMode::SingleShot);
        assert!(!settings.session.publish_status);
        assert!(!settings.session.read_metadata);
        assert!(settings.sensors.is_enabled(SensorKind::Magnetometer));
    }
}
