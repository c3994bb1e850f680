//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client id prefix; a fresh suffix is appended per session
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "smartbox-tracker".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    4000
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_event_queue_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device name used to derive `smartbox_<name>/...` topics
    #[serde(default = "default_device_name")]
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { name: default_device_name() }
    }
}

fn default_device_name() -> String {
    "box01".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    #[serde(default = "default_pick_up_radius_m")]
    pub pick_up_radius_m: f64,
    #[serde(default = "default_arrival_radius_m")]
    pub arrival_radius_m: f64,
    #[serde(default = "default_device_test_radius_m")]
    pub device_test_radius_m: f64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            pick_up_radius_m: default_pick_up_radius_m(),
            arrival_radius_m: default_arrival_radius_m(),
            device_test_radius_m: default_device_test_radius_m(),
        }
    }
}

fn default_pick_up_radius_m() -> f64 {
    50.0
}

fn default_arrival_radius_m() -> f64 {
    150.0
}

fn default_device_test_radius_m() -> f64 {
    20.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_code_resend_cooldown_secs")]
    pub code_resend_cooldown_secs: u64,
    #[serde(default = "default_parcel_poll_secs")]
    pub parcel_poll_secs: u64,
    #[serde(default = "default_travel_poll_secs")]
    pub travel_poll_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            code_resend_cooldown_secs: default_code_resend_cooldown_secs(),
            parcel_poll_secs: default_parcel_poll_secs(),
            travel_poll_secs: default_travel_poll_secs(),
        }
    }
}

fn default_code_resend_cooldown_secs() -> u64 {
    60
}

fn default_parcel_poll_secs() -> u64 {
    5
}

fn default_travel_poll_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { base_url: default_remote_base_url(), token: None, timeout_ms: default_remote_timeout_ms() }
    }
}

fn default_remote_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_remote_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an in-process broker (local testing against the mock device)
    #[serde(default)]
    pub embedded: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { embedded: false, bind_address: default_broker_bind_address(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_keep_alive_secs: u64,
    mqtt_connect_timeout_ms: u64,
    mqtt_reconnect_interval_ms: u64,
    event_queue_capacity: usize,
    device_name: String,
    pick_up_radius_m: f64,
    arrival_radius_m: f64,
    device_test_radius_m: f64,
    code_resend_cooldown_secs: u64,
    parcel_poll_secs: u64,
    travel_poll_secs: u64,
    remote_base_url: String,
    remote_token: Option<String>,
    remote_timeout_ms: u64,
    broker_embedded: bool,
    broker_bind_address: String,
    broker_port: u16,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_keep_alive_secs: toml_config.mqtt.keep_alive_secs,
            mqtt_connect_timeout_ms: toml_config.mqtt.connect_timeout_ms,
            mqtt_reconnect_interval_ms: toml_config.mqtt.reconnect_interval_ms,
            event_queue_capacity: toml_config.mqtt.event_queue_capacity,
            device_name: toml_config.device.name,
            pick_up_radius_m: toml_config.geofence.pick_up_radius_m,
            arrival_radius_m: toml_config.geofence.arrival_radius_m,
            device_test_radius_m: toml_config.geofence.device_test_radius_m,
            code_resend_cooldown_secs: toml_config.lifecycle.code_resend_cooldown_secs,
            parcel_poll_secs: toml_config.lifecycle.parcel_poll_secs,
            travel_poll_secs: toml_config.lifecycle.travel_poll_secs,
            remote_base_url: toml_config.remote.base_url,
            remote_token: toml_config.remote.token,
            remote_timeout_ms: toml_config.remote.timeout_ms,
            broker_embedded: toml_config.broker.embedded,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that would make the runtime misbehave
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_name.trim().is_empty() {
            anyhow::bail!("device.name must not be empty");
        }
        if self.event_queue_capacity == 0 {
            anyhow::bail!("mqtt.event_queue_capacity must be at least 1");
        }
        for (name, radius) in [
            ("geofence.pick_up_radius_m", self.pick_up_radius_m),
            ("geofence.arrival_radius_m", self.arrival_radius_m),
            ("geofence.device_test_radius_m", self.device_test_radius_m),
        ] {
            if !radius.is_finite() || radius <= 0.0 {
                anyhow::bail!("{name} must be a positive number of meters, got {radius}");
            }
        }
        if self.parcel_poll_secs == 0 || self.travel_poll_secs == 0 {
            anyhow::bail!("lifecycle poll intervals must be at least 1 second");
        }
        if self.metrics_interval_secs == 0 {
            anyhow::bail!("metrics.interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Load from an explicit path, falling back to defaults with a warning
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_fallback_to_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(Self::resolve_config_path(args))
    }

    pub fn with_mqtt_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.mqtt_host = host.into();
        self.mqtt_port = port;
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_embedded_broker(mut self, embedded: bool) -> Self {
        self.broker_embedded = embedded;
        self
    }

    pub fn with_broker_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    // Getters for all config fields
    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keep_alive_secs)
    }

    pub fn mqtt_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_connect_timeout_ms)
    }

    pub fn mqtt_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_interval_ms)
    }

    pub fn event_queue_capacity(&self) -> usize {
        self.event_queue_capacity
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn pick_up_radius_m(&self) -> f64 {
        self.pick_up_radius_m
    }

    pub fn arrival_radius_m(&self) -> f64 {
        self.arrival_radius_m
    }

    pub fn device_test_radius_m(&self) -> f64 {
        self.device_test_radius_m
    }

    pub fn code_resend_cooldown(&self) -> Duration {
        Duration::from_secs(self.code_resend_cooldown_secs)
    }

    pub fn parcel_poll_interval(&self) -> Duration {
        Duration::from_secs(self.parcel_poll_secs)
    }

    pub fn travel_poll_interval(&self) -> Duration {
        Duration::from_secs(self.travel_poll_secs)
    }

    pub fn remote_base_url(&self) -> &str {
        &self.remote_base_url
    }

    pub fn remote_token(&self) -> Option<&str> {
        self.remote_token.as_deref()
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn broker_embedded(&self) -> bool {
        self.broker_embedded
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
