//! Configuration data types.

use crate::health::ProbeSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Session placement settings shared by every pool
    #[serde(default)]
    pub balancing: BalancingConfig,

    /// How backend failures are detected
    #[serde(default)]
    pub fault_detection: FaultDetectionConfig,

    /// Frontend definitions (where we listen)
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,

    /// Backend pool definitions
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

impl Config {
    /// Look up a pool by name.
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Session placement settings handed to every balancing plugin.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct BalancingConfig {
    /// Backups assigned to each session
    #[serde(default = "default_num_backup_servers")]
    pub num_backup_servers: usize,

    /// Weight of a backup assignment in a server's load score
    #[serde(default = "default_backup_session_weight")]
    pub backup_session_weight: f64,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            num_backup_servers: default_num_backup_servers(),
            backup_session_weight: default_backup_session_weight(),
        }
    }
}

/// Fault detection strategy and its settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FaultDetectionConfig {
    /// Which detector monitors backends
    #[serde(default)]
    pub strategy: DetectionStrategy,

    /// Active probing settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Passive heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Detector used for every backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStrategy {
    #[default]
    Probe,
    Heartbeat,
}

/// Active probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// How often to probe backends
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a probe
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
        }
    }
}

impl From<&ProbeConfig> for ProbeSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            interval: config.interval,
            timeout: config.timeout,
        }
    }
}

/// Passive heartbeat configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    /// UDP address the heartbeat server listens on
    #[serde(default = "default_heartbeat_listen")]
    pub listen: SocketAddr,

    /// How often backends send beacons
    #[serde(default = "default_heartbeat_frequency", with = "humantime_serde")]
    pub frequency: Duration,

    /// Silence after which a backend is down
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            listen: default_heartbeat_listen(),
            frequency: default_heartbeat_frequency(),
            timeout: default_heartbeat_timeout(),
        }
    }
}

/// Frontend configuration (listener).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendConfig {
    /// Unique name for this frontend
    pub name: String,

    /// Address and port to listen on
    pub listen: SocketAddr,

    /// Name of the backend pool to use
    pub pool: String,

    /// Timeout for connecting to a backend
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Backend pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Unique name for this pool
    pub name: String,

    /// Control protocol spoken by the pool's servers
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Backend servers as "host:port"
    pub servers: Vec<String>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_num_backup_servers() -> usize {
    1
}

fn default_backup_session_weight() -> f64 {
    0.1
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn default_heartbeat_frequency() -> Duration {
    Duration::from_millis(200)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_millis(350)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
