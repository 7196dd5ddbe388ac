//! Target registry - the source of truth for what gets probed
//!
//! The registry keeps all [`PingTarget`]s in a copy-on-write snapshot. Readers
//! (the scheduler on every tick, the orchestrator on every result) clone an
//! `Arc` to the current map and never wait for a writer's full update; writers
//! are serialized, rebuild the map, and swap it in under a briefly held lock.
//!
//! Every mutation is also announced on a broadcast channel so the scheduler can
//! drop or reset schedule entries without scanning.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::{DeviceId, PingTarget};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no ping target registered for device {0}")]
    TargetNotFound(DeviceId),
}

/// Change notification published after every registry mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetChange {
    Upserted(DeviceId),
    MonitoringStarted(DeviceId),
    MonitoringStopped(DeviceId),
    Removed(DeviceId),
}

impl TargetChange {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            TargetChange::Upserted(id)
            | TargetChange::MonitoringStarted(id)
            | TargetChange::MonitoringStopped(id)
            | TargetChange::Removed(id) => id,
        }
    }
}

/// Desired attributes of a target, as delivered by the device feed or config
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub device_id: DeviceId,
    pub ip_address: IpAddr,
    pub hostname: Option<String>,

    /// `None` keeps the current interval (or the default for new targets)
    pub interval_secs: Option<u32>,
}

impl TargetSpec {
    pub fn new(device_id: impl Into<DeviceId>, ip_address: IpAddr) -> Self {
        Self {
            device_id: device_id.into(),
            ip_address,
            hostname: None,
            interval_secs: None,
        }
    }

    pub fn with_hostname(self, hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..self
        }
    }

    pub fn with_interval(self, interval_secs: u32) -> Self {
        Self {
            interval_secs: Some(interval_secs),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub target: PingTarget,

    /// True when no target existed for the device before
    pub created: bool,

    /// True when the stored target was modified (always true on create)
    pub changed: bool,

    /// Set when the probe address changed on a monitored target
    pub previous_address: Option<String>,

    /// The target as it was before this write; `None` on create
    pub previous: Option<PingTarget>,
}

/// Result of toggling the `monitored` flag
#[derive(Debug, Clone, PartialEq)]
pub enum MonitoringToggle {
    Changed {
        target: PingTarget,
        previous: PingTarget,
    },
    Unchanged(PingTarget),
}

impl MonitoringToggle {
    pub fn target(&self) -> &PingTarget {
        match self {
            MonitoringToggle::Changed { target, .. } | MonitoringToggle::Unchanged(target) => target,
        }
    }

    pub fn into_target(self) -> PingTarget {
        match self {
            MonitoringToggle::Changed { target, .. } | MonitoringToggle::Unchanged(target) => target,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, MonitoringToggle::Changed { .. })
    }
}

/// Allowed probe intervals, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBounds {
    pub default_secs: u32,
    pub min_secs: u32,
    pub max_secs: u32,
}

impl IntervalBounds {
    /// Clamp a requested interval into `[min, max]`; `None` takes the default
    pub fn clamp(&self, requested: Option<u32>) -> u32 {
        let Some(requested) = requested else {
            return self.default_secs;
        };

        let clamped = requested.clamp(self.min_secs, self.max_secs);
        if clamped != requested {
            warn!(
                "ping interval {requested}s outside [{}, {}], clamped to {clamped}s",
                self.min_secs, self.max_secs
            );
        }
        clamped
    }
}

impl From<&SchedulerConfig> for IntervalBounds {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            default_secs: config.default_interval_secs,
            min_secs: config.min_interval_secs,
            max_secs: config.max_interval_secs,
        }
    }
}

type TargetMap = HashMap<DeviceId, PingTarget>;

pub struct TargetRegistry {
    /// Current snapshot, swapped wholesale on every write
    targets: RwLock<Arc<TargetMap>>,

    /// Serializes writers so concurrent copy-on-write updates never lose each other
    write_lock: Mutex<()>,

    bounds: IntervalBounds,

    change_tx: broadcast::Sender<TargetChange>,
}

impl TargetRegistry {
    pub fn new(bounds: IntervalBounds) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            targets: RwLock::new(Arc::new(HashMap::new())),
            write_lock: Mutex::new(()),
            bounds,
            change_tx,
        }
    }

    pub fn bounds(&self) -> IntervalBounds {
        self.bounds
    }

    /// Cheap handle to the current set of targets
    pub fn snapshot(&self) -> Arc<TargetMap> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TargetChange> {
        self.change_tx.subscribe()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<PingTarget> {
        self.snapshot().get(device_id).cloned()
    }

    pub fn contains_monitored(&self, device_id: &DeviceId) -> bool {
        self.snapshot()
            .get(device_id)
            .is_some_and(|target| target.monitored)
    }

    pub fn list_monitored(&self) -> Vec<PingTarget> {
        self.snapshot()
            .values()
            .filter(|target| target.monitored)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Create or update the target for `spec.device_id`
    pub fn upsert(&self, spec: TargetSpec) -> UpsertOutcome {
        let outcome = self.write(|targets| {
            let TargetSpec {
                device_id,
                ip_address,
                hostname,
                interval_secs,
            } = spec;

            let Some(existing) = targets.get(&device_id).cloned() else {
                let interval = self.bounds.clamp(interval_secs);
                let target = PingTarget::new(device_id.clone(), ip_address, hostname, interval);
                targets.insert(device_id, target.clone());
                return UpsertOutcome {
                    target,
                    created: true,
                    changed: true,
                    previous_address: None,
                    previous: None,
                };
            };

            let previous_address = existing.probe_address();
            let mut target = existing.clone();
            if target.ip_address != ip_address {
                target = target.with_ip_address(ip_address);
            }
            if target.hostname != hostname_key(hostname.as_deref()) {
                target = target.with_hostname(hostname);
            }
            if interval_secs.is_some() {
                let interval = self.bounds.clamp(interval_secs);
                if interval != target.interval_secs {
                    target = target.with_interval(interval);
                }
            }

            let changed = target.version != existing.version;
            let address_changed = target.probe_address() != previous_address
                || target.ip_address != existing.ip_address;
            targets.insert(device_id, target.clone());

            UpsertOutcome {
                previous_address: (address_changed && existing.monitored)
                    .then_some(previous_address),
                previous: Some(existing),
                target,
                created: false,
                changed,
            }
        });

        if outcome.changed {
            debug!(
                device_id = %outcome.target.device_id,
                created = outcome.created,
                "ping target upserted"
            );
            self.notify(TargetChange::Upserted(outcome.target.device_id.clone()));
        }

        outcome
    }

    /// Toggle monitoring; a no-op when the target is already in the requested state
    pub fn set_monitored(
        &self,
        device_id: &DeviceId,
        monitored: bool,
    ) -> Result<MonitoringToggle, RegistryError> {
        let toggle = self.write(|targets| {
            let existing = targets
                .get(device_id)
                .cloned()
                .ok_or_else(|| RegistryError::TargetNotFound(device_id.clone()))?;

            if existing.monitored == monitored {
                return Ok(MonitoringToggle::Unchanged(existing));
            }

            let target = existing.clone().with_monitored(monitored);
            targets.insert(device_id.clone(), target.clone());
            Ok(MonitoringToggle::Changed {
                target,
                previous: existing,
            })
        })?;

        if toggle.changed() {
            debug!(%device_id, monitored, "monitoring toggled");
            self.notify(if monitored {
                TargetChange::MonitoringStarted(device_id.clone())
            } else {
                TargetChange::MonitoringStopped(device_id.clone())
            });
        } else {
            debug!(%device_id, monitored, "monitoring already in requested state");
        }

        Ok(toggle)
    }

    pub fn remove(&self, device_id: &DeviceId) -> Result<PingTarget, RegistryError> {
        let removed = self.write(|targets| {
            targets
                .remove(device_id)
                .ok_or_else(|| RegistryError::TargetNotFound(device_id.clone()))
        })?;

        debug!(%device_id, "ping target removed");
        self.notify(TargetChange::Removed(device_id.clone()));
        Ok(removed)
    }

    /// Undo a write whose persistence failed
    ///
    /// `previous` is put back (or the target dropped when it is `None`) only if
    /// `attempted` is still the current entry; a later write wins. Returns
    /// whether the entry was rolled back.
    pub fn revert(&self, attempted: &PingTarget, previous: Option<PingTarget>) -> bool {
        let device_id = &attempted.device_id;
        let change = self.write(|targets| {
            if targets.get(device_id) != Some(attempted) {
                return None;
            }
            Some(match previous {
                Some(previous) => {
                    let change = if previous.monitored == attempted.monitored {
                        TargetChange::Upserted(device_id.clone())
                    } else if previous.monitored {
                        TargetChange::MonitoringStarted(device_id.clone())
                    } else {
                        TargetChange::MonitoringStopped(device_id.clone())
                    };
                    targets.insert(device_id.clone(), previous);
                    change
                }
                None => {
                    targets.remove(device_id);
                    TargetChange::Removed(device_id.clone())
                }
            })
        });

        match change {
            Some(change) => {
                debug!(%device_id, "registry write rolled back");
                self.notify(change);
                true
            }
            None => {
                debug!(%device_id, "registry moved on, keeping newer target");
                false
            }
        }
    }

    /// Seed the registry with previously persisted targets
    ///
    /// Targets already present are left untouched. No change notifications are
    /// published; the scheduler picks restored targets up on its next tick.
    pub fn restore(&self, restored: Vec<PingTarget>) -> usize {
        self.write(|targets| {
            let mut count = 0;
            for mut target in restored {
                let clamped = target.interval_secs.clamp(self.bounds.min_secs, self.bounds.max_secs);
                if clamped != target.interval_secs {
                    target = target.with_interval(clamped);
                }
                if !targets.contains_key(&target.device_id) {
                    targets.insert(target.device_id.clone(), target);
                    count += 1;
                }
            }
            count
        })
    }

    /// Run `update` against a private copy of the map and publish the copy
    fn write<T>(&self, update: impl FnOnce(&mut TargetMap) -> T) -> T {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = (*self.snapshot()).clone();
        let out = update(&mut next);

        *self.targets.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        out
    }

    fn notify(&self, change: TargetChange) {
        if self.change_tx.send(change).is_err() {
            trace!("no subscribers for target change");
        }
    }
}

fn hostname_key(hostname: Option<&str>) -> Option<String> {
    hostname
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
