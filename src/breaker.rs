//! Per-device circuit breaker
//!
//! Stops probing devices that keep failing and periodically lets a single
//! trial probe through to find out whether they came back.
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                │ open_duration elapsed,
//!     │ trial succeeds                 │ next allow() is the trial
//!     │                                ▼
//!     └──────────────────────────── HALF_OPEN
//!                trial fails ──▶ OPEN (open time reset)
//! ```
//!
//! State lives in memory only and starts CLOSED for every device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::DeviceId;
use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub total_devices: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,

    /// Probes refused since startup
    pub skipped_probes: u64,
}

#[derive(Debug)]
struct Circuit {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl Circuit {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_started_at = None;
    }
}

pub struct CircuitBreaker {
    enabled: bool,
    failure_threshold: u32,
    open_duration: Duration,
    half_open_interval: Duration,

    circuits: RwLock<HashMap<DeviceId, Arc<Mutex<Circuit>>>>,
    skipped: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold,
            open_duration: config.open_duration(),
            half_open_interval: config.half_open_interval(),
            circuits: RwLock::new(HashMap::new()),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// May a probe be sent to `device_id` right now?
    pub fn allow(&self, device_id: &DeviceId) -> bool {
        self.allow_at(device_id, Instant::now())
    }

    pub fn allow_at(&self, device_id: &DeviceId, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        // devices without a circuit have never failed
        let Some(circuit) = self.existing(device_id) else {
            return true;
        };
        let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);

        let allowed = match circuit.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = circuit
                    .opened_at
                    .is_none_or(|opened_at| now.saturating_duration_since(opened_at) >= self.open_duration);
                if elapsed {
                    circuit.state = BreakerState::HalfOpen;
                    circuit.trial_started_at = Some(now);
                    info!(%device_id, "circuit breaker half-open, allowing trial probe");
                }
                elapsed
            }
            BreakerState::HalfOpen => {
                let stale = circuit.trial_started_at.is_none_or(|started| {
                    now.saturating_duration_since(started) >= self.half_open_interval
                });
                if stale {
                    circuit.trial_started_at = Some(now);
                    debug!(%device_id, "no trial result yet, allowing another trial probe");
                }
                stale
            }
        };

        if !allowed {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    pub fn record_result(&self, device_id: &DeviceId, success: bool) {
        self.record_result_at(device_id, success, Instant::now());
    }

    pub fn record_result_at(&self, device_id: &DeviceId, success: bool, now: Instant) {
        if !self.enabled {
            return;
        }

        if success {
            // a success on an unknown device leaves nothing to reset
            let Some(circuit) = self.existing(device_id) else {
                return;
            };
            let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);
            if circuit.state != BreakerState::Closed {
                info!(%device_id, "circuit breaker closed after successful probe");
            }
            *circuit = Circuit::closed();
            return;
        }

        let circuit = self.circuit(device_id);
        let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);
        match circuit.state {
            BreakerState::Closed => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
                if circuit.consecutive_failures >= self.failure_threshold {
                    circuit.open(now);
                    warn!(
                        %device_id,
                        failures = circuit.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
                circuit.open(now);
                warn!(%device_id, "trial probe failed, circuit breaker re-opened");
            }
            BreakerState::Open => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// Current state; devices never seen are CLOSED
    pub fn state(&self, device_id: &DeviceId) -> BreakerState {
        self.existing(device_id)
            .map(|circuit| circuit.lock().unwrap_or_else(PoisonError::into_inner).state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Force the device's breaker back to CLOSED
    pub fn reset(&self, device_id: &DeviceId) {
        if let Some(circuit) = self.existing(device_id) {
            *circuit.lock().unwrap_or_else(PoisonError::into_inner) = Circuit::closed();
            info!(%device_id, "circuit breaker reset");
        }
    }

    /// Drop every breaker, returning all devices to CLOSED
    pub fn clear_all(&self) {
        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        let count = circuits.len();
        circuits.clear();
        info!("cleared {count} circuit breakers");
    }

    /// Forget a device entirely (it was removed or is no longer monitored)
    pub fn forget(&self, device_id: &DeviceId) {
        let removed = self
            .circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id);
        if removed.is_some() {
            debug!(%device_id, "circuit breaker state dropped");
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);

        let mut metrics = BreakerMetrics {
            total_devices: circuits.len(),
            skipped_probes: self.skipped.load(Ordering::Relaxed),
            ..Default::default()
        };
        for circuit in circuits.values() {
            match circuit.lock().unwrap_or_else(PoisonError::into_inner).state {
                BreakerState::Closed => metrics.closed += 1,
                BreakerState::Open => metrics.open += 1,
                BreakerState::HalfOpen => metrics.half_open += 1,
            }
        }
        metrics
    }

    fn existing(&self, device_id: &DeviceId) -> Option<Arc<Mutex<Circuit>>> {
        self.circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    fn circuit(&self, device_id: &DeviceId) -> Arc<Mutex<Circuit>> {
        if let Some(circuit) = self.existing(device_id) {
            return circuit;
        }

        self.circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::closed())))
            .clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
