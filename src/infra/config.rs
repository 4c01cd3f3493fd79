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
pub struct SiteConfig {
    /// Unique site identifier, used as MQTT client id suffix and in logs
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "presence".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Subscription filter; the topic prefix is derived from it
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_backoff_min_secs")]
    pub reconnect_backoff_min_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub reconnect_backoff_max_secs: u64,
    /// Inbound message queue between the MQTT loop and the ingestor
    #[serde(default = "default_inbound_queue_size")]
    pub inbound_queue_size: usize,
}

fn default_mqtt_topic() -> String {
    "rtls/gateways/#".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_backoff_min_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_inbound_queue_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Heartbeat silence after which a gateway is considered offline
    #[serde(default = "default_offline_threshold_secs")]
    pub offline_threshold_secs: u64,
    /// Open presence sessions idle longer than this are closed (0 disables)
    #[serde(default = "default_stale_session_ttl_secs")]
    pub stale_session_ttl_secs: u64,
}

fn default_offline_threshold_secs() -> u64 {
    60
}

fn default_stale_session_ttl_secs() -> u64 {
    120
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            offline_threshold_secs: default_offline_threshold_secs(),
            stale_session_ttl_secs: default_stale_session_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_webhook_queue_size")]
    pub queue_size: usize,
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

fn default_webhook_queue_size() -> usize {
    1000
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self { timeout_ms: default_webhook_timeout_ms(), queue_size: default_webhook_queue_size() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_rollup_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rollup_interval_minutes")]
    pub interval_minutes: u64,
    /// Raw samples older than this are rolled up and purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Sample gap that splits two presence sessions
    #[serde(default = "default_gap_seconds")]
    pub gap_seconds: u64,
}

fn default_rollup_enabled() -> bool {
    true
}

fn default_rollup_interval_minutes() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    30
}

fn default_gap_seconds() -> u64 {
    120
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: default_rollup_enabled(),
            interval_minutes: default_rollup_interval_minutes(),
            retention_days: default_retention_days(),
            gap_seconds: default_gap_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval_secs() -> u64 {
    30
}

fn default_prometheus_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: default_prometheus_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Upper bound on any single storage call
    #[serde(default = "default_storage_timeout_ms")]
    pub timeout_ms: u64,
    /// JSON catalog loaded into the in-memory store at startup
    #[serde(default)]
    pub seed_file: Option<String>,
}

fn default_storage_timeout_ms() -> u64 {
    5000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { timeout_ms: default_storage_timeout_ms(), seed_file: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_client_id: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_keep_alive_secs: u64,
    mqtt_backoff_min_secs: u64,
    mqtt_backoff_max_secs: u64,
    inbound_queue_size: usize,
    offline_threshold_secs: u64,
    stale_session_ttl_secs: u64,
    webhook_timeout_ms: u64,
    webhook_queue_size: usize,
    rollup_enabled: bool,
    rollup_interval_minutes: u64,
    retention_days: u32,
    gap_seconds: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    storage_timeout_ms: u64,
    seed_file: Option<String>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: default_mqtt_topic(),
            mqtt_client_id: None,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_keep_alive_secs: default_keep_alive_secs(),
            mqtt_backoff_min_secs: default_backoff_min_secs(),
            mqtt_backoff_max_secs: default_backoff_max_secs(),
            inbound_queue_size: default_inbound_queue_size(),
            offline_threshold_secs: default_offline_threshold_secs(),
            stale_session_ttl_secs: default_stale_session_ttl_secs(),
            webhook_timeout_ms: default_webhook_timeout_ms(),
            webhook_queue_size: default_webhook_queue_size(),
            rollup_enabled: default_rollup_enabled(),
            rollup_interval_minutes: default_rollup_interval_minutes(),
            retention_days: default_retention_days(),
            gap_seconds: default_gap_seconds(),
            metrics_interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
            storage_timeout_ms: default_storage_timeout_ms(),
            seed_file: None,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
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

        let mqtt = toml_config.mqtt;
        if mqtt.reconnect_backoff_min_secs == 0
            || mqtt.reconnect_backoff_max_secs < mqtt.reconnect_backoff_min_secs
        {
            anyhow::bail!(
                "Invalid reconnect backoff in {}: min must be > 0 and <= max",
                path.display()
            );
        }

        Ok(Self {
            site_id: toml_config.site.id,
            mqtt_host: mqtt.host,
            mqtt_port: mqtt.port,
            mqtt_topic: mqtt.topic,
            mqtt_client_id: mqtt.client_id,
            mqtt_username: mqtt.username,
            mqtt_password: mqtt.password,
            mqtt_keep_alive_secs: mqtt.keep_alive_secs,
            mqtt_backoff_min_secs: mqtt.reconnect_backoff_min_secs,
            mqtt_backoff_max_secs: mqtt.reconnect_backoff_max_secs,
            inbound_queue_size: mqtt.inbound_queue_size.max(1),
            offline_threshold_secs: toml_config.liveness.offline_threshold_secs,
            stale_session_ttl_secs: toml_config.liveness.stale_session_ttl_secs,
            webhook_timeout_ms: toml_config.webhooks.timeout_ms,
            webhook_queue_size: toml_config.webhooks.queue_size.max(1),
            rollup_enabled: toml_config.rollup.enabled,
            rollup_interval_minutes: toml_config.rollup.interval_minutes.max(1),
            retention_days: toml_config.rollup.retention_days,
            gap_seconds: toml_config.rollup.gap_seconds,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            prometheus_port: toml_config.metrics.prometheus_port,
            storage_timeout_ms: toml_config.storage.timeout_ms,
            seed_file: toml_config.storage.seed_file,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from command-line args - tries TOML file first,
    /// falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Liveness sweep period: half the offline threshold, clamped to 5..=60s
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs((self.offline_threshold_secs / 2).clamp(5, 60))
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    /// Explicit client id, or one derived from the site id
    pub fn mqtt_client_id(&self) -> String {
        self.mqtt_client_id.clone().unwrap_or_else(|| format!("presence-engine-{}", self.site_id))
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_keep_alive_secs(&self) -> u64 {
        self.mqtt_keep_alive_secs
    }

    pub fn mqtt_backoff_min(&self) -> Duration {
        Duration::from_secs(self.mqtt_backoff_min_secs)
    }

    pub fn mqtt_backoff_max(&self) -> Duration {
        Duration::from_secs(self.mqtt_backoff_max_secs)
    }

    pub fn inbound_queue_size(&self) -> usize {
        self.inbound_queue_size
    }

    pub fn offline_threshold_secs(&self) -> u64 {
        self.offline_threshold_secs
    }

    pub fn stale_session_ttl_secs(&self) -> u64 {
        self.stale_session_ttl_secs
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn webhook_queue_size(&self) -> usize {
        self.webhook_queue_size
    }

    pub fn rollup_enabled(&self) -> bool {
        self.rollup_enabled
    }

    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_interval_minutes * 60)
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn gap_seconds(&self) -> u64 {
        self.gap_seconds
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn seed_file(&self) -> Option<&str> {
        self.seed_file.as_deref()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the offline threshold
    #[cfg(test)]
    pub fn with_offline_threshold_secs(mut self, secs: u64) -> Self {
        self.offline_threshold_secs = secs;
        self
    }
}
