//! Application configuration and sensor option resolution.
//!
//! Configuration is loaded once at startup from a TOML file plus
//! `TAGSTREAM__SECTION__KEY` environment overrides. It covers:
//! - Discovery behaviour ([`ScanConfig`], [`ScanMode`])
//! - Per-sensor period overrides and enablement ([`SensorOptions`])
//! - Per-connection switches ([`SessionConfig`])
//! - Telemetry sink selection ([`TelemetryConfig`])
//!
//! [`resolve`] turns [`SensorOptions`] into the effective per-sensor
//! [`SensorConfig`] the sessions run with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ::config::{Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sensor::{descriptor_for, SensorKind};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "TAGSTREAM_CONFIG";

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("MAC address pattern is valid")
});

/// Check a `XX:XX:XX:XX:XX:XX` Bluetooth address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discovery settings.
    pub scan: ScanConfig,

    /// Sensor overrides.
    pub sensors: SensorOptions,

    /// Per-connection switches.
    pub session: SessionConfig,

    /// Telemetry sink settings.
    pub telemetry: TelemetryConfig,
}

/// How discovery behaves around found devices and terminated sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    /// Never stop scanning; restart it after every session termination.
    #[default]
    Continuous,
    /// Stop scanning when a device is accepted; restart it after every
    /// session termination.
    StopOnFind,
    /// Stop scanning when the first device is accepted and never restart it.
    SingleShot,
}

impl ScanMode {
    /// Whether accepting a device stops the scan.
    #[must_use]
    pub const fn stops_on_find(self) -> bool {
        matches!(self, Self::StopOnFind | Self::SingleShot)
    }

    /// Whether a session termination restarts the scan.
    #[must_use]
    pub const fn rearms_on_termination(self) -> bool {
        matches!(self, Self::Continuous | Self::StopOnFind)
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan mode.
    pub mode: ScanMode,

    /// BlueZ adapter name; the default adapter when unset.
    pub adapter: Option<String>,

    /// Regex the advertised local name must match.
    pub name_filter: Option<String>,

    /// Only these addresses are accepted when non-empty.
    pub allowed_devices: Vec<String>,
}

/// User override for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorOverride {
    /// Sampling period; the descriptor default when unset or zero.
    #[serde(default)]
    pub period_ms: Option<u32>,

    /// Set to `false` to keep the table but disable the sensor.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SensorOverride {
    /// An enabled override with an explicit period.
    #[must_use]
    pub const fn period(period_ms: u32) -> Self {
        Self {
            period_ms: Some(period_ms),
            enabled: true,
        }
    }
}

impl Default for SensorOverride {
    fn default() -> Self {
        Self {
            period_ms: None,
            enabled: true,
        }
    }
}

/// Per-sensor user options. A sensor without a table is disabled.
///
/// Only sensor tables live here, so enablement is decided by the tables
/// alone. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorOptions {
    /// Magnetometer.
    #[serde(default)]
    pub magnetometer: Option<SensorOverride>,
    /// Luxometer.
    #[serde(default)]
    pub luxometer: Option<SensorOverride>,
    /// Humidity.
    #[serde(default)]
    pub humidity: Option<SensorOverride>,
    /// IR temperature.
    #[serde(default)]
    pub ir_temperature: Option<SensorOverride>,
    /// Gyroscope.
    #[serde(default)]
    pub gyroscope: Option<SensorOverride>,
    /// Accelerometer.
    #[serde(default)]
    pub accelerometer: Option<SensorOverride>,
    /// Barometric pressure.
    #[serde(default)]
    pub barometric_pressure: Option<SensorOverride>,
}

impl SensorOptions {
    /// Options with no sensor enabled.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            magnetometer: None,
            luxometer: None,
            humidity: None,
            ir_temperature: None,
            gyroscope: None,
            accelerometer: None,
            barometric_pressure: None,
        }
    }

    /// The user override for `kind`, if any.
    #[must_use]
    pub const fn get(&self, kind: SensorKind) -> Option<&SensorOverride> {
        match kind {
            SensorKind::Magnetometer => self.magnetometer.as_ref(),
            SensorKind::Luxometer => self.luxometer.as_ref(),
            SensorKind::Humidity => self.humidity.as_ref(),
            SensorKind::IrTemperature => self.ir_temperature.as_ref(),
            SensorKind::Gyroscope => self.gyroscope.as_ref(),
            SensorKind::Accelerometer => self.accelerometer.as_ref(),
            SensorKind::BarometricPressure => self.barometric_pressure.as_ref(),
            SensorKind::SimpleKey => None,
        }
    }

    /// Set the override for `kind`. Ignored for [`SensorKind::SimpleKey`],
    /// which is driven by [`SessionConfig::notify_simple_key`].
    pub fn set(&mut self, kind: SensorKind, value: Option<SensorOverride>) {
        let slot = match kind {
            SensorKind::Magnetometer => &mut self.magnetometer,
            SensorKind::Luxometer => &mut self.luxometer,
            SensorKind::Humidity => &mut self.humidity,
            SensorKind::IrTemperature => &mut self.ir_temperature,
            SensorKind::Gyroscope => &mut self.gyroscope,
            SensorKind::Accelerometer => &mut self.accelerometer,
            SensorKind::BarometricPressure => &mut self.barometric_pressure,
            SensorKind::SimpleKey => return,
        };
        *slot = value;
    }
}

impl Default for SensorOptions {
    fn default() -> Self {
        Self {
            magnetometer: Some(SensorOverride::period(2000)),
            luxometer: Some(SensorOverride::period(2500)),
            humidity: Some(SensorOverride::period(2500)),
            ir_temperature: Some(SensorOverride::period(2500)),
            ..Self::none()
        }
    }
}

/// Switches applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Subscribe to button and reed relay notifications.
    pub notify_simple_key: bool,

    /// Read device information once per connection for the log stream.
    pub read_metadata: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            notify_simple_key: false,
            read_metadata: true,
        }
    }
}

/// Where telemetry goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Write records to the process log.
    #[default]
    Log,
    /// POST records to an HTTP endpoint.
    Http,
}

/// Telemetry sink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Publish `sensorTagStatus` connectivity events.
    pub publish_status: bool,

    /// Sink selection.
    pub sink: SinkKind,

    /// Base URL of the HTTP sink.
    pub endpoint: Option<String>,

    /// Environment variable holding the HTTP sink bearer token.
    pub token_env: String,

    /// HTTP request timeout.
    pub timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            publish_status: true,
            sink: SinkKind::Log,
            endpoint: None,
            token_env: "TAGSTREAM_TOKEN".to_string(),
            timeout_secs: 10,
        }
    }
}

const fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be parsed or is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from `path` plus environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be parsed or the result is
    /// invalid.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("TAGSTREAM")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("scan.allowed_devices"),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or is invalid.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration file path.
    ///
    /// `TAGSTREAM_CONFIG` wins; otherwise `/etc/tagstream/config.toml` on
    /// Linux and the platform config directory elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if no config directory exists for this platform.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/tagstream/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "tagstream")
                .ok_or(ConfigError::NoConfigDir)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }

    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.name_filter()?;

        if let Some(bad) = self
            .scan
            .allowed_devices
            .iter()
            .find(|addr| !is_valid_mac_address(addr))
        {
            return Err(ConfigError::InvalidAddress(bad.clone()));
        }

        if self.telemetry.sink == SinkKind::Http {
            let endpoint = self
                .telemetry
                .endpoint
                .as_deref()
                .ok_or(ConfigError::MissingEndpoint)?;
            url::Url::parse(endpoint).map_err(|source| ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                source,
            })?;
        }

        Ok(())
    }

    /// Compiled advertised-name filter, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern does not compile.
    pub fn name_filter(&self) -> Result<Option<Regex>, ConfigError> {
        self.scan
            .name_filter
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidNameFilter {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Effective per-sensor configuration.
    #[must_use]
    pub fn resolved_sensors(&self) -> ResolvedSensors {
        resolve(&self.sensors, self.session.notify_simple_key)
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Effective configuration of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorConfig {
    /// Whether the sensor is configured at all.
    pub enabled: bool,
    /// Sampling period written to the device.
    pub period_ms: u32,
}

/// Effective configuration of every sensor kind. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSensors {
    configs: BTreeMap<SensorKind, SensorConfig>,
}

impl ResolvedSensors {
    /// Configuration for `kind`.
    #[must_use]
    pub fn get(&self, kind: SensorKind) -> SensorConfig {
        self.configs.get(&kind).copied().unwrap_or(SensorConfig {
            enabled: false,
            period_ms: descriptor_for(kind).default_period_ms,
        })
    }

    /// Whether `kind` is enabled.
    #[must_use]
    pub fn is_enabled(&self, kind: SensorKind) -> bool {
        self.get(kind).enabled
    }

    /// Enabled sensors in configuration order.
    pub fn enabled(&self) -> impl Iterator<Item = (SensorKind, SensorConfig)> + '_ {
        SensorKind::ALL
            .into_iter()
            .map(|kind| (kind, self.get(kind)))
            .filter(|(_, config)| config.enabled)
    }
}

/// Merge user options with descriptor defaults.
///
/// A positive period override wins; otherwise the descriptor default is
/// used. Sensors without options are disabled. The simple key is enabled by
/// `notify_simple_key` alone.
#[must_use]
pub fn resolve(options: &SensorOptions, notify_simple_key: bool) -> ResolvedSensors {
    let configs = SensorKind::ALL
        .into_iter()
        .map(|kind| {
            let default_period = descriptor_for(kind).default_period_ms;
            let config = match (kind, options.get(kind)) {
                (SensorKind::SimpleKey, _) => SensorConfig {
                    enabled: notify_simple_key,
                    period_ms: default_period,
                },
                (_, Some(over)) => SensorConfig {
                    enabled: over.enabled,
                    period_ms: over
                        .period_ms
                        .filter(|&ms| ms > 0)
                        .unwrap_or(default_period),
                },
                (_, None) => SensorConfig {
                    enabled: false,
                    period_ms: default_period,
                },
            };
            (kind, config)
        })
        .collect();
    ResolvedSensors { configs }
}
