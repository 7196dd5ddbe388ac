use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file provided: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Ping results older than this are deleted
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./ping-monitoring.db")
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,

    /// Targets registered and monitored at startup
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitoring.validate()?;

        for target in &self.targets {
            if target.device_id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "target device_id must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Everything the engine itself needs, passed explicitly into constructors
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub alerting: AlertingConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl MonitoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let probe = &self.probe;
        if probe.timeout_ms == 0 {
            return invalid("probe.timeout_ms must be greater than zero");
        }
        if probe.method == ProbeMethod::Tcp && probe.tcp_port == 0 {
            return invalid("probe.tcp_port must be set for the tcp probe method");
        }

        let scheduler = &self.scheduler;
        if scheduler.tick_interval_ms == 0 {
            return invalid("scheduler.tick_interval_ms must be greater than zero");
        }
        if scheduler.max_concurrent_probes == 0 {
            return invalid("scheduler.max_concurrent_probes must be greater than zero");
        }
        if scheduler.metrics_log_interval_secs == 0 {
            return invalid("scheduler.metrics_log_interval_secs must be greater than zero");
        }
        if scheduler.min_interval_secs == 0 {
            return invalid("scheduler.min_interval_secs must be greater than zero");
        }
        if scheduler.min_interval_secs > scheduler.max_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "scheduler.min_interval_secs ({}) exceeds scheduler.max_interval_secs ({})",
                scheduler.min_interval_secs, scheduler.max_interval_secs
            )));
        }
        if !(scheduler.min_interval_secs..=scheduler.max_interval_secs)
            .contains(&scheduler.default_interval_secs)
        {
            return Err(ConfigError::Invalid(format!(
                "scheduler.default_interval_secs ({}) must lie within [{}, {}]",
                scheduler.default_interval_secs,
                scheduler.min_interval_secs,
                scheduler.max_interval_secs
            )));
        }

        if self.alerting.failure_threshold == 0 {
            return invalid("alerting.failure_threshold must be greater than zero");
        }
        if self.alerting.recovery_threshold == 0 {
            return invalid("alerting.recovery_threshold must be greater than zero");
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be greater than zero");
        }
        if breaker.open_duration_secs == 0 {
            return invalid("circuit_breaker.open_duration_secs must be greater than zero");
        }
        if breaker.half_open_interval_secs == 0 {
            return invalid("circuit_breaker.half_open_interval_secs must be greater than zero");
        }

        Ok(())
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Icmp,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_method")]
    pub method: ProbeMethod,

    /// Hard timeout for a single probe
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Port used by the tcp probe method
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: default_probe_method(),
            timeout_ms: default_probe_timeout_ms(),
            tcp_port: default_tcp_port(),
        }
    }
}

fn default_probe_method() -> ProbeMethod {
    ProbeMethod::Icmp
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_tcp_port() -> u16 {
    80
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Global ceiling on in-flight probes
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u32,

    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u32,

    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u32,

    /// How often the scheduler logs its throughput metrics
    #[serde(default = "default_metrics_log_interval_secs")]
    pub metrics_log_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_log_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent_probes: default_max_concurrent_probes(),
            default_interval_secs: default_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_max_concurrent_probes() -> usize {
    1000
}

fn default_interval_secs() -> u32 {
    5
}

fn default_min_interval_secs() -> u32 {
    1
}

fn default_max_interval_secs() -> u32 {
    3600
}

fn default_metrics_log_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    /// Consecutive failures before a device is reported down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before a down device is reported recovered
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// When false, the breaker allows every probe
    #[serde(default = "default_breaker_enabled")]
    pub enabled: bool,

    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,

    #[serde(default = "default_half_open_interval_secs")]
    pub half_open_interval_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_secs)
    }

    pub fn half_open_interval(&self) -> Duration {
        Duration::from_secs(self.half_open_interval_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_breaker_enabled(),
            failure_threshold: default_breaker_failure_threshold(),
            open_duration_secs: default_open_duration_secs(),
            half_open_interval_secs: default_half_open_interval_secs(),
        }
    }
}

fn default_breaker_enabled() -> bool {
    true
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_open_duration_secs() -> u64 {
    300
}

fn default_half_open_interval_secs() -> u64 {
    60
}

/// A target declared statically in the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub device_id: String,
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub interval: Option<u32>,
    #[serde(default = "default_target_monitored")]
    pub monitored: bool,
}

fn default_target_monitored() -> bool {
    true
}

/// Read, parse and validate a JSON configuration file
pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = serde_json::from_str(&file_content)?;
    trace!("loaded config: {config:?}");

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Tests
// ============================================================================
