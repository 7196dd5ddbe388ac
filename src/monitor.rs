//! Ping monitor - the engine's service facade
//!
//! Wires the target registry, circuit breaker, prober, scheduler actor and
//! orchestrator together and exposes the operations callers actually use:
//! registering targets, toggling monitoring, consuming device changes and
//! reading back results and metrics.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ping_monitoring::config::MonitoringConfig;
//! use ping_monitoring::events::BroadcastSink;
//! use ping_monitoring::monitor::PingMonitor;
//! use ping_monitoring::probe::build_prober;
//! use ping_monitoring::registry::TargetSpec;
//! use ping_monitoring::storage::MemoryBackend;
//! use ping_monitoring::DeviceId;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MonitoringConfig::default();
//!     let prober = build_prober(&config.probe);
//!     let monitor = PingMonitor::start(
//!         &config,
//!         Arc::new(MemoryBackend::new()),
//!         Arc::new(BroadcastSink::new(1024)),
//!         prober,
//!     )
//!     .await?;
//!
//!     monitor.register_target(TargetSpec::new("router", "192.168.1.1".parse()?)).await?;
//!     monitor.start_monitoring(&DeviceId::new("router")).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::actors::{SchedulerHandle, SchedulerMetrics, TickReport};
use crate::alert::AlertPolicy;
use crate::breaker::{BreakerMetrics, CircuitBreaker};
use crate::config::{ConfigError, MonitoringConfig};
use crate::events::{EventSink, MonitoringEvent};
use crate::feed::DeviceChange;
use crate::orchestrator::{CleanupReport, MonitoringOrchestrator};
use crate::probe::Prober;
use crate::registry::{IntervalBounds, MonitoringToggle, RegistryError, TargetRegistry, TargetSpec};
use crate::storage::{PingStatistics, StorageBackend, StorageError};
use crate::{AlertState, DeviceId, PingResult, PingTarget};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("scheduler unavailable: {0}")]
    Scheduler(String),
}

impl MonitorError {
    fn scheduler(error: anyhow::Error) -> Self {
        MonitorError::Scheduler(format!("{error:#}"))
    }
}

/// Combined view of the engine's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorMetrics {
    pub targets: usize,
    pub monitored_targets: usize,
    pub scheduler: SchedulerMetrics,
    pub breaker: BreakerMetrics,
}

pub struct PingMonitor {
    registry: Arc<TargetRegistry>,
    breaker: Arc<CircuitBreaker>,
    storage: Arc<dyn StorageBackend>,
    orchestrator: Arc<MonitoringOrchestrator>,
    scheduler: SchedulerHandle,
}

impl PingMonitor {
    /// Validate the configuration, restore persisted targets and start the scheduler
    pub async fn start(
        config: &MonitoringConfig,
        storage: Arc<dyn StorageBackend>,
        sink: Arc<dyn EventSink>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;

        let registry = Arc::new(TargetRegistry::new(IntervalBounds::from(&config.scheduler)));
        let restored = registry.restore(storage.load_targets().await?);
        info!(
            restored,
            monitored = registry.list_monitored().len(),
            "restored persisted ping targets"
        );

        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));
        let orchestrator = Arc::new(MonitoringOrchestrator::new(
            registry.clone(),
            storage.clone(),
            sink,
            AlertPolicy::from(&config.alerting),
        ));
        let scheduler = SchedulerHandle::spawn(
            &config.scheduler,
            registry.clone(),
            breaker.clone(),
            prober,
            orchestrator.clone(),
        );

        Ok(Self {
            registry,
            breaker,
            storage,
            orchestrator,
            scheduler,
        })
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Create or update a target
    ///
    /// A changed probe address on a monitored target is announced with a
    /// `TargetAddressChanged` event.
    #[instrument(skip(self, spec), fields(device_id = %spec.device_id))]
    pub async fn register_target(&self, spec: TargetSpec) -> Result<PingTarget, MonitorError> {
        let outcome = self.registry.upsert(spec);
        if !outcome.changed {
            return Ok(outcome.target);
        }

        self.persist_or_revert(&outcome.target, outcome.previous).await?;

        if let Some(previous_address) = outcome.previous_address {
            info!(
                from = %previous_address,
                to = %outcome.target.probe_address(),
                "probe address changed"
            );
            self.orchestrator
                .publish(MonitoringEvent::TargetAddressChanged {
                    device_id: outcome.target.device_id.clone(),
                    previous_address,
                    address: outcome.target.probe_address(),
                    timestamp: Utc::now(),
                })
                .await;
        }

        Ok(outcome.target)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn start_monitoring(&self, device_id: &DeviceId) -> Result<PingTarget, MonitorError> {
        let (target, previous) = match self.registry.set_monitored(device_id, true)? {
            MonitoringToggle::Changed { target, previous } => (target, previous),
            MonitoringToggle::Unchanged(target) => return Ok(target),
        };

        self.persist_or_revert(&target, Some(previous)).await?;
        info!(address = %target.probe_address(), "monitoring started");
        self.orchestrator
            .publish(MonitoringEvent::MonitoringStarted {
                device_id: device_id.clone(),
                address: target.probe_address(),
                timestamp: Utc::now(),
            })
            .await;

        Ok(target)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn stop_monitoring(&self, device_id: &DeviceId) -> Result<PingTarget, MonitorError> {
        let (target, previous) = match self.registry.set_monitored(device_id, false)? {
            MonitoringToggle::Changed { target, previous } => (target, previous),
            MonitoringToggle::Unchanged(target) => return Ok(target),
        };

        self.persist_or_revert(&target, Some(previous)).await?;
        self.breaker.forget(device_id);
        info!(address = %target.probe_address(), "monitoring stopped");
        self.orchestrator
            .publish(MonitoringEvent::MonitoringStopped {
                device_id: device_id.clone(),
                address: target.probe_address(),
                timestamp: Utc::now(),
            })
            .await;

        Ok(target)
    }

    /// Forget a device entirely: its target, breaker state, results and alert state
    ///
    /// Safe to call for devices the engine never knew about.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn deregister_device(&self, device_id: &DeviceId) -> Result<CleanupReport, MonitorError> {
        match self.registry.remove(device_id) {
            Ok(target) if target.monitored => {
                self.orchestrator
                    .publish(MonitoringEvent::MonitoringStopped {
                        device_id: device_id.clone(),
                        address: target.probe_address(),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            Ok(_) => {}
            Err(RegistryError::TargetNotFound(_)) => {
                debug!("device has no ping target, cleaning up stored data only");
            }
        }

        self.breaker.forget(device_id);
        self.storage.delete_target(device_id).await?;
        let report = self.orchestrator.cleanup_device_data(device_id).await?;

        info!(
            results_deleted = report.results_deleted,
            "device deregistered"
        );
        Ok(report)
    }

    /// Apply one notification from the device inventory
    #[instrument(skip_all, fields(device_id = %change.device_id()))]
    pub async fn apply_device_change(&self, change: DeviceChange) -> Result<(), MonitorError> {
        match change {
            DeviceChange::Created {
                device_id,
                ip_address,
                hostname,
                interval_secs,
                monitored,
            } => {
                let mut spec = TargetSpec::new(device_id.clone(), ip_address);
                if let Some(hostname) = hostname {
                    spec = spec.with_hostname(hostname);
                }
                if let Some(interval_secs) = interval_secs {
                    spec = spec.with_interval(interval_secs);
                }
                self.register_target(spec).await?;
                if monitored {
                    self.start_monitoring(&device_id).await?;
                }
            }

            DeviceChange::Updated {
                device_id,
                ip_address,
                hostname,
            } => {
                let existing = self.registry.get(&device_id);
                let Some(ip) = ip_address.or(existing.as_ref().map(|t| t.ip_address)) else {
                    debug!("update for unknown device without an address, ignoring");
                    return Ok(());
                };

                let mut spec = TargetSpec::new(device_id, ip);
                if let Some(hostname) = hostname.or(existing.and_then(|t| t.hostname)) {
                    spec = spec.with_hostname(hostname);
                }
                self.register_target(spec).await?;
            }

            DeviceChange::Deleted { device_id } => {
                self.deregister_device(&device_id).await?;
            }
        }

        Ok(())
    }

    pub fn reset_breaker(&self, device_id: &DeviceId) {
        self.breaker.reset(device_id);
    }

    pub fn clear_all_breakers(&self) {
        self.breaker.clear_all();
    }

    pub async fn metrics(&self) -> Result<MonitorMetrics, MonitorError> {
        let scheduler = self
            .scheduler
            .get_metrics()
            .await
            .map_err(MonitorError::scheduler)?;
        let snapshot = self.registry.snapshot();

        Ok(MonitorMetrics {
            targets: snapshot.len(),
            monitored_targets: snapshot.values().filter(|t| t.monitored).count(),
            scheduler,
            breaker: self.breaker.metrics(),
        })
    }

    /// Reachability statistics of a known device since `since`
    pub async fn statistics(
        &self,
        device_id: &DeviceId,
        since: DateTime<Utc>,
    ) -> Result<PingStatistics, MonitorError> {
        if self.registry.get(device_id).is_none() {
            return Err(RegistryError::TargetNotFound(device_id.clone()).into());
        }
        Ok(self.storage.calculate_statistics(device_id, since).await?)
    }

    /// The `limit` most recent results of a device, oldest first
    pub async fn recent_results(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> Result<Vec<PingResult>, MonitorError> {
        Ok(self.storage.query_latest_results(device_id, limit).await?)
    }

    pub async fn alert_state(&self, device_id: &DeviceId) -> Result<Option<AlertState>, MonitorError> {
        Ok(self.storage.load_alert_state(device_id).await?)
    }

    /// Drop results older than `before`; returns how many were deleted
    pub async fn purge_results_before(&self, before: DateTime<Utc>) -> Result<usize, MonitorError> {
        Ok(self.storage.cleanup_old_results(before).await?)
    }

    /// Run a scheduling pass now instead of waiting for the next tick
    pub async fn tick_now(&self) -> Result<TickReport, MonitorError> {
        self.scheduler.tick_now().await.map_err(MonitorError::scheduler)
    }

    /// Stop scheduling new probes and close the storage backend
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("scheduler already stopped: {e:#}");
        }
        self.storage.close().await?;
        info!("ping monitor stopped");
        Ok(())
    }

    /// Persist a registry write, rolling the registry back if the save fails
    ///
    /// A failed save leaves the registry as it was, so a retry repeats the
    /// whole write and its event.
    async fn persist_or_revert(
        &self,
        target: &PingTarget,
        previous: Option<PingTarget>,
    ) -> Result<(), MonitorError> {
        self.persist_target(target).await.inspect_err(|e| {
            warn!("failed to persist ping target, rolling back: {e}");
            self.registry.revert(target, previous);
        })
    }

    async fn persist_target(&self, target: &PingTarget) -> Result<(), MonitorError> {
        match self.storage.save_target(target).await {
            Ok(()) => Ok(()),
            // a concurrent caller already stored a newer version
            Err(StorageError::VersionConflict {
                stored, attempted, ..
            }) => {
                debug!(stored, attempted, "skipping stale target write");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
