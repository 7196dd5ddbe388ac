pub mod actors;
pub mod alert;
pub mod breaker;
pub mod config;
pub mod events;
pub mod feed;
pub mod monitor;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod storage;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a monitored device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A device the engine knows how to probe
///
/// Exactly one target exists per device. Every mutation goes through one of the
/// `with_*` methods, which return a new value with `version` incremented and
/// `updated_at` refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingTarget {
    pub device_id: DeviceId,

    pub ip_address: IpAddr,

    /// Preferred over the IP address when probing, if present
    pub hostname: Option<String>,

    /// Whether the scheduler should probe this target
    pub monitored: bool,

    /// Seconds between probes, already clamped to the configured bounds
    pub interval_secs: u32,

    /// Optimistic-concurrency counter, starts at 1
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PingTarget {
    /// Create an unmonitored target at version 1
    pub fn new(
        device_id: DeviceId,
        ip_address: IpAddr,
        hostname: Option<String>,
        interval_secs: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            ip_address,
            hostname: normalize_hostname(hostname),
            monitored: false,
            interval_secs,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_ip_address(self, ip_address: IpAddr) -> Self {
        Self {
            ip_address,
            ..self
        }
        .bumped()
    }

    pub fn with_hostname(self, hostname: Option<String>) -> Self {
        Self {
            hostname: normalize_hostname(hostname),
            ..self
        }
        .bumped()
    }

    pub fn with_interval(self, interval_secs: u32) -> Self {
        Self {
            interval_secs,
            ..self
        }
        .bumped()
    }

    pub fn with_monitored(self, monitored: bool) -> Self {
        Self { monitored, ..self }.bumped()
    }

    /// The address handed to the prober: hostname when set, IP otherwise
    pub fn probe_address(&self) -> String {
        match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => self.ip_address.to_string(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_secs))
    }

    fn bumped(self) -> Self {
        Self {
            version: self.version + 1,
            updated_at: Utc::now(),
            ..self
        }
    }
}

fn normalize_hostname(hostname: Option<String>) -> Option<String> {
    hostname
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Outcome of a single probe attempt
///
/// A successful result always carries a response time and never an error
/// message; a failed one is the reverse. Use [`PingResult::success`] and
/// [`PingResult::failure`] to build them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub device_id: DeviceId,

    /// The address that was actually probed
    pub address: String,

    pub success: bool,

    pub response_time_ms: Option<f64>,

    pub error_message: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl PingResult {
    pub fn success(
        device_id: DeviceId,
        address: impl Into<String>,
        response_time_ms: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            address: address.into(),
            success: true,
            response_time_ms: Some(response_time_ms),
            error_message: None,
            timestamp,
        }
    }

    pub fn failure(
        device_id: DeviceId,
        address: impl Into<String>,
        error_message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            address: address.into(),
            success: false,
            response_time_ms: None,
            error_message: Some(error_message.into()),
            timestamp,
        }
    }
}

/// Per-device alert bookkeeping
///
/// At most one of `consecutive_failures` and `consecutive_successes` is
/// non-zero at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub device_id: DeviceId,
    pub alert_active: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_alert_sent: Option<DateTime<Utc>>,
    pub last_recovery_sent: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertState {
    pub fn new(device_id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            alert_active: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_alert_sent: None,
            last_recovery_sent: None,
            last_failure_time: None,
            last_success_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_success(self, now: DateTime<Utc>) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: self.consecutive_successes.saturating_add(1),
            last_success_time: Some(now),
            updated_at: now,
            ..self
        }
    }

    pub fn record_failure(self, now: DateTime<Utc>) -> Self {
        Self {
            consecutive_failures: self.consecutive_failures.saturating_add(1),
            consecutive_successes: 0,
            last_failure_time: Some(now),
            updated_at: now,
            ..self
        }
    }

    pub fn activate_alert(self, now: DateTime<Utc>) -> Self {
        Self {
            alert_active: true,
            last_alert_sent: Some(now),
            updated_at: now,
            ..self
        }
    }

    pub fn deactivate_alert(self, now: DateTime<Utc>) -> Self {
        Self {
            alert_active: false,
            last_recovery_sent: Some(now),
            updated_at: now,
            ..self
        }
    }

    pub fn should_trigger_alert(&self, failure_threshold: u32) -> bool {
        !self.alert_active && self.consecutive_failures >= failure_threshold
    }

    pub fn should_resolve_alert(&self, recovery_threshold: u32) -> bool {
        self.alert_active && self.consecutive_successes >= recovery_threshold
    }
}

// ============================================================================
// Tests
// ============================================================================
