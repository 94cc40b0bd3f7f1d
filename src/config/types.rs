use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::etcd::EtcdConfig;

/// Root configuration file: every operator setting lives under the `eco` key.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub eco: Config,
}

/// Global configuration for one operator instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Period of the convergence control loop
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// How long a member may stay unhealthy before the cleaner evicts it
    #[serde(with = "humantime_serde")]
    pub unhealthy_member_ttl: Duration,

    /// Underlying etcd server settings
    pub etcd: EtcdConfig,

    /// Auto-scaling group provider selector + params
    pub asg: AsgConfig,

    /// Snapshot provider selector + schedule
    pub snapshot: SnapshotConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            unhealthy_member_ttl: Duration::from_secs(120),
            etcd: EtcdConfig::default(),
            asg: AsgConfig::default(),
            snapshot: SnapshotConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Auto-scaling group provider configuration.
///
/// Provider-specific keys sit next to `provider` and are handed to the
/// selected provider for parsing.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AsgConfig {
    #[serde(default)]
    pub provider: String,

    #[serde(flatten)]
    pub params: HashMap<String, serde_yml::Value>,
}

/// Snapshot provider configuration and schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_snapshot_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default)]
    pub provider: String,

    #[serde(flatten)]
    pub params: HashMap<String, serde_yml::Value>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: default_snapshot_interval(),
            ttl: default_snapshot_ttl(),
            provider: String::new(),
            params: HashMap::new(),
        }
    }
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_snapshot_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Enable file logging; stdout logging is always on
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file to write when file logging is enabled
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_logging_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
