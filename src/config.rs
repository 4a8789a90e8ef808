//! Bridge configuration.
//!
//! Loaded from a JSON5 file. Every timing heuristic the bridge relies on
//! is exposed here as a named, tunable parameter; the defaults are the
//! values the SDM120 has been observed to tolerate in the field.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
///
/// Validation failures are the only fatal errors in the bridge: polling
/// must never start against an invalid target.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// The SDM120 device to poll.
    pub device: DeviceConfig,

    /// MQTT broker settings.
    pub mqtt: MqttConfig,

    /// Link supervision settings.
    #[serde(default)]
    pub link: LinkConfig,

    /// Per-parameter retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Poll cadence settings.
    #[serde(default)]
    pub poll: PollConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The remote meter address and read timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Meter IPv4 address.
    pub host: String,

    /// Modbus TCP port (default: 502).
    #[serde(default = "default_device_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247).
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-read response timeout in milliseconds.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Settling delay between parameter reads in milliseconds. The
    /// SDM120 drops requests that arrive back-to-back.
    #[serde(default = "default_inter_parameter_delay_ms")]
    pub inter_parameter_delay_ms: u64,

    /// Extra settling delay after each of the first few reads of a
    /// batch, in milliseconds.
    #[serde(default = "default_warmup_delay_ms")]
    pub warmup_delay_ms: u64,
}

fn default_device_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_inter_parameter_delay_ms() -> u64 {
    50
}

fn default_warmup_delay_ms() -> u64 {
    100
}

impl DeviceConfig {
    /// Socket address of the meter.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: Ipv4Addr = self.host.parse().map_err(|_| {
            ConfigError::Validation(format!("device.host is not an IPv4 address: '{}'", self.host))
        })?;
        Ok(SocketAddr::from((ip, self.port)))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn inter_parameter_delay(&self) -> Duration {
        Duration::from_millis(self.inter_parameter_delay_ms)
    }

    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }
}

/// Link supervision policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Host probed for link liveness (default: the device host).
    #[serde(default)]
    pub probe_host: Option<String>,

    /// Port probed for link liveness (default: the device port).
    #[serde(default)]
    pub probe_port: Option<u16>,

    /// Timeout for one liveness probe in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// How long the startup connect blocks, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Background monitor interval in milliseconds.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Probe attempts per reconnection round before the link is
    /// declared failed. The monitor keeps starting new rounds forever.
    #[serde(default = "default_link_max_attempts")]
    pub max_attempts: u32,

    /// Delay between probe attempts within a round, in milliseconds.
    #[serde(default = "default_link_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    15000
}

fn default_monitor_interval_ms() -> u64 {
    10000
}

fn default_link_max_attempts() -> u32 {
    5
}

fn default_link_backoff_ms() -> u64 {
    1000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            probe_host: None,
            probe_port: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            max_attempts: default_link_max_attempts(),
            backoff_ms: default_link_backoff_ms(),
        }
    }
}

impl LinkConfig {
    /// Address probed for link liveness.
    pub fn probe_addr(&self, device: &DeviceConfig) -> Result<SocketAddr, ConfigError> {
        let host = self.probe_host.as_deref().unwrap_or(&device.host);
        let port = self.probe_port.unwrap_or(device.port);
        let ip: Ipv4Addr = host.parse().map_err(|_| {
            ConfigError::Validation(format!("link.probe_host is not an IPv4 address: '{}'", host))
        })?;
        Ok(SocketAddr::from((ip, port)))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Per-parameter retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per parameter, including the first (default: 3).
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Additional delay per subsequent retry, in milliseconds.
    #[serde(default = "default_retry_step_delay_ms")]
    pub step_delay_ms: u64,

    /// Consecutive timed-out parameters before the link state is
    /// checked as a diagnostic.
    #[serde(default = "default_link_check_after_timeouts")]
    pub link_check_after_timeouts: u32,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_step_delay_ms() -> u64 {
    300
}

fn default_link_check_after_timeouts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            step_delay_ms: default_retry_step_delay_ms(),
            link_check_after_timeouts: default_link_check_after_timeouts(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Poll cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between poll cycles in milliseconds.
    #[serde(default = "default_poll_period_ms")]
    pub period_ms: u64,

    /// Extra delay after a cycle in which every read failed, in
    /// milliseconds.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
}

fn default_poll_period_ms() -> u64 {
    5000
}

fn default_recovery_delay_ms() -> u64 {
    2000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            period_ms: default_poll_period_ms(),
            recovery_delay_ms: default_recovery_delay_ms(),
        }
    }
}

impl PollConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or address.
    pub host: String,

    /// Broker port (default: 1883).
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional credentials; both or neither.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Topic prefix for all published messages.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// MQTT keep-alive in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Publish each parameter to its own subtopic.
    #[serde(default = "default_true")]
    pub individual_topics: bool,

    /// Home Assistant discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "sdm120-bridge".to_string()
}

fn default_topic_prefix() -> String {
    "energy/sdm120".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl MqttConfig {
    /// Availability topic, also registered as the last-will target.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Home Assistant MQTT discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Emit discovery messages on each broker (re)connection.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Discovery topic prefix.
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,

    /// Delay between the connection event and the discovery batch, in
    /// milliseconds.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_settle_delay_ms() -> u64 {
    1000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_discovery_prefix(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Failures here abort startup; nothing else in the bridge does.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.socket_addr()?;

        if self.device.unit_id == 0 || self.device.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "device.unit_id must be 1-247, got {}",
                self.device.unit_id
            )));
        }

        if self.device.response_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "device.response_timeout_ms must be nonzero".to_string(),
            ));
        }

        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.host cannot be empty".to_string(),
            ));
        }

        if self.mqtt.topic_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.topic_prefix cannot be empty".to_string(),
            ));
        }

        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            return Err(ConfigError::Validation(
                "mqtt credentials require both username and password".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.link.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "link.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.poll.period_ms == 0 {
            return Err(ConfigError::Validation(
                "poll.period_ms must be nonzero".to_string(),
            ));
        }

        self.link.probe_addr(&self.device)?;

        Ok(())
    }
}
