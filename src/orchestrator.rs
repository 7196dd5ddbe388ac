//! Monitoring orchestrator - turns probe results into state and events
//!
//! ## Message Flow
//!
//! ```text
//! probe task ─▶ process_ping_result ─┬─▶ save result ─▶ PingResultRecorded
//!                (per-device lock)   └─▶ load AlertState ─▶ evaluate ─▶ save
//!                                                              └─▶ DeviceDown / DeviceRecovered
//! ```
//!
//! Work for one device is serialized through a fixed set of async mutexes
//! chosen by hashing the device ID, so results for the same device never
//! interleave while different devices proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::alert::{AlertPolicy, AlertTransition};
use crate::events::{EventSink, MonitoringEvent};
use crate::registry::TargetRegistry;
use crate::storage::{StorageBackend, StorageResult};
use crate::{AlertState, DeviceId, PingResult};

const LOCK_SHARDS: usize = 256;

/// What happened to a result handed to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The result was persisted and the alert state updated
    Recorded {
        state: AlertState,
        transition: Option<AlertTransition>,
    },

    /// The device is no longer a monitored target; nothing was written
    Discarded,
}

/// What `cleanup_device_data` removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub results_deleted: usize,
    pub alert_state_deleted: bool,
}

pub struct MonitoringOrchestrator {
    registry: Arc<TargetRegistry>,
    storage: Arc<dyn StorageBackend>,
    sink: Arc<dyn EventSink>,
    policy: AlertPolicy,
    locks: Vec<Mutex<()>>,
}

impl MonitoringOrchestrator {
    pub fn new(
        registry: Arc<TargetRegistry>,
        storage: Arc<dyn StorageBackend>,
        sink: Arc<dyn EventSink>,
        policy: AlertPolicy,
    ) -> Self {
        Self {
            registry,
            storage,
            sink,
            policy,
            locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn policy(&self) -> AlertPolicy {
        self.policy
    }

    /// Persist one probe result, advance the device's alert state and publish
    /// the resulting events
    ///
    /// Results for devices that are no longer monitored are discarded.
    /// Storage errors are returned (and logged) without publishing transition
    /// events; the next result for the device retries naturally.
    #[instrument(skip_all, fields(device_id = %result.device_id, success = result.success))]
    pub async fn process_ping_result(&self, result: PingResult) -> StorageResult<ProcessOutcome> {
        let _guard = self.lock_for(&result.device_id).lock().await;

        if !self.registry.contains_monitored(&result.device_id) {
            debug!("discarding result for device that is no longer monitored");
            return Ok(ProcessOutcome::Discarded);
        }

        self.record(result).await.inspect_err(|e| {
            error!("failed to process ping result: {e}");
        })
    }

    async fn record(&self, result: PingResult) -> StorageResult<ProcessOutcome> {
        let device_id = result.device_id.clone();

        self.storage.save_ping_result(&result).await?;
        self.publish(MonitoringEvent::PingResultRecorded {
            device_id: device_id.clone(),
            success: result.success,
            response_time_ms: result.response_time_ms,
            timestamp: result.timestamp,
        })
        .await;

        let state = match self.storage.load_alert_state(&device_id).await? {
            Some(state) => state,
            None => AlertState::new(device_id.clone(), result.timestamp),
        };

        let evaluation = self.policy.evaluate(state, result.success, result.timestamp);
        self.storage.save_alert_state(&evaluation.state).await?;

        match evaluation.transition {
            Some(AlertTransition::Triggered) => {
                warn!(
                    address = %result.address,
                    failures = evaluation.state.consecutive_failures,
                    "device is down"
                );
                self.publish(MonitoringEvent::DeviceDown {
                    device_id,
                    address: result.address,
                    timestamp: result.timestamp,
                })
                .await;
            }
            Some(AlertTransition::Resolved) => {
                info!(
                    address = %result.address,
                    successes = evaluation.state.consecutive_successes,
                    "device recovered"
                );
                self.publish(MonitoringEvent::DeviceRecovered {
                    device_id,
                    address: result.address,
                    timestamp: result.timestamp,
                })
                .await;
            }
            None => {}
        }

        Ok(ProcessOutcome::Recorded {
            state: evaluation.state,
            transition: evaluation.transition,
        })
    }

    /// Delete every stored result and the alert state of a device
    ///
    /// Runs under the device's lock, so no result for the device is mid-flight
    /// while the data is removed.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn cleanup_device_data(&self, device_id: &DeviceId) -> StorageResult<CleanupReport> {
        let _guard = self.lock_for(device_id).lock().await;

        let results_deleted = self.storage.delete_ping_results_for_device(device_id).await?;
        let alert_state_deleted = self.storage.delete_alert_state(device_id).await?;

        info!(results_deleted, alert_state_deleted, "device data cleaned up");
        Ok(CleanupReport {
            results_deleted,
            alert_state_deleted,
        })
    }

    /// Publish an event; sink failures are logged and swallowed
    pub async fn publish(&self, event: MonitoringEvent) {
        let kind = event.kind();
        let device_id = event.device_id().clone();
        if let Err(e) = self.sink.publish(event).await {
            warn!(%device_id, "failed to publish {kind} event: {e}");
        }
    }

    fn lock_for(&self, device_id: &DeviceId) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        &self.locks[(hasher.finish() % self.locks.len() as u64) as usize]
    }
}

// ============================================================================
// Tests
// ============================================================================
