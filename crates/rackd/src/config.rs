//! Configuration for rackd.
//!
//! Loads settings from /etc/rackd/config.toml or uses defaults. A missing
//! file is fine; a malformed one is not.

use rack_common::paths::{CONFIG_PATH, STATE_DIR, STORAGE_ROOT};
use rack_common::PackagingMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::scheduler::IntervalRange;
use crate::services::{rack_catalog, ServiceDescriptor};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which process backend naming to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagingChoice {
    /// Detect from the environment
    #[default]
    Auto,
    Native,
    Sandboxed,
}

impl PackagingChoice {
    pub fn resolve(self) -> PackagingMode {
        match self {
            PackagingChoice::Auto => PackagingMode::detect(),
            PackagingChoice::Native => PackagingMode::Native,
            PackagingChoice::Sandboxed => PackagingMode::Sandboxed,
        }
    }
}

/// Service monitor loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_min")]
    pub interval_min_secs: u64,

    #[serde(default = "default_monitor_max")]
    pub interval_max_secs: u64,

    /// Consecutive unknown reads before warning
    #[serde(default = "default_unknown_warn_threshold")]
    pub unknown_warn_threshold: u32,

    /// Per backend command timeout
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Attempts per backend command; only timeouts are retried
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,

    #[serde(default = "default_true")]
    pub run_immediately: bool,
}

fn default_monitor_min() -> u64 {
    60
}

fn default_monitor_max() -> u64 {
    120
}

fn default_unknown_warn_threshold() -> u32 {
    3
}

fn default_command_timeout() -> u64 {
    8
}

fn default_command_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_min_secs: default_monitor_min(),
            interval_max_secs: default_monitor_max(),
            unknown_warn_threshold: default_unknown_warn_threshold(),
            command_timeout_secs: default_command_timeout(),
            command_retries: default_command_retries(),
            run_immediately: default_true(),
        }
    }
}

/// Expired row collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowGcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_row_database")]
    pub database: PathBuf,

    #[serde(default = "default_row_table")]
    pub table: String,

    #[serde(default = "default_row_column")]
    pub timestamp_column: String,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_row_min")]
    pub interval_min_secs: u64,

    #[serde(default = "default_row_max")]
    pub interval_max_secs: u64,
}

fn default_row_database() -> PathBuf {
    Path::new(STATE_DIR).join("rackd.db")
}

fn default_row_table() -> String {
    "dns_publication".to_string()
}

fn default_row_column() -> String {
    "created".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_row_min() -> u64 {
    3600
}

fn default_row_max() -> u64 {
    7200
}

impl Default for RowGcConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            database: default_row_database(),
            table: default_row_table(),
            timestamp_column: default_row_column(),
            retention_days: default_retention_days(),
            interval_min_secs: default_row_min(),
            interval_max_secs: default_row_max(),
        }
    }
}

/// Boot resource storage collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageGcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    #[serde(default = "default_storage_min")]
    pub interval_min_secs: u64,

    #[serde(default = "default_storage_max")]
    pub interval_max_secs: u64,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(STORAGE_ROOT)
}

fn default_storage_min() -> u64 {
    1800
}

fn default_storage_max() -> u64 {
    3600
}

impl Default for StorageGcConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            storage_root: default_storage_root(),
            interval_min_secs: default_storage_min(),
            interval_max_secs: default_storage_max(),
        }
    }
}

/// Cluster settings source. Without a database every setting is absent
/// and toggleable services fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigStoreConfig {
    #[serde(default)]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus textfile written after every monitor pass
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Upper bound on waiting for in-flight ticks at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub packaging: PackagingChoice,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub row_gc: RowGcConfig,

    #[serde(default)]
    pub storage_gc: StorageGcConfig,

    #[serde(default)]
    pub config_store: ConfigStoreConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Monitored services; the built-in rack catalog when absent
    #[serde(default)]
    pub services: Option<Vec<ServiceDescriptor>>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(STATE_DIR)
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            shutdown_grace_secs: default_shutdown_grace(),
            packaging: PackagingChoice::default(),
            monitor: MonitorConfig::default(),
            row_gc: RowGcConfig::default(),
            storage_gc: StorageGcConfig::default(),
            config_store: ConfigStoreConfig::default(),
            metrics: MetricsConfig::default(),
            services: None,
        }
    }
}

impl DaemonConfig {
    /// Load from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Path::new(CONFIG_PATH))
    }

    /// Load and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Config {} not found, using defaults", path.display());
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: DaemonConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitor_interval()?;
        self.row_gc_interval()?;
        self.storage_gc_interval()?;

        if self.row_gc.retention_days == 0 {
            return Err(ConfigError::Invalid("row_gc.retention_days must be positive".to_string()));
        }
        if self.monitor.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid("monitor.command_timeout_secs must be positive".to_string()));
        }

        if let Some(services) = &self.services {
            let mut seen = HashSet::new();
            for desc in services {
                if desc.name.trim().is_empty() || desc.service_name.trim().is_empty() {
                    return Err(ConfigError::Invalid("service names must not be empty".to_string()));
                }
                if !seen.insert(desc.name.as_str()) {
                    return Err(ConfigError::Invalid(format!("service '{}' listed twice", desc.name)));
                }
            }
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Result<IntervalRange, ConfigError> {
        interval("monitor", self.monitor.interval_min_secs, self.monitor.interval_max_secs)
    }

    pub fn row_gc_interval(&self) -> Result<IntervalRange, ConfigError> {
        interval("row_gc", self.row_gc.interval_min_secs, self.row_gc.interval_max_secs)
    }

    pub fn storage_gc_interval(&self) -> Result<IntervalRange, ConfigError> {
        interval(
            "storage_gc",
            self.storage_gc.interval_min_secs,
            self.storage_gc.interval_max_secs,
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.command_timeout_secs)
    }

    pub fn row_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.row_gc.retention_days))
    }

    /// Configured services, or the built-in catalog
    pub fn service_catalog(&self) -> Vec<ServiceDescriptor> {
        self.services.clone().unwrap_or_else(rack_catalog)
    }
}

fn interval(section: &str, min: u64, max: u64) -> Result<IntervalRange, ConfigError> {
    if min == 0 {
        return Err(ConfigError::Invalid(format!("{}.interval_min_secs must be positive", section)));
    }
    IntervalRange::from_secs(min, max).map_err(|e| ConfigError::Invalid(format!("{}: {}", section, e)))
}
