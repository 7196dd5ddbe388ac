//! In-memory storage backend (no persistence)
//!
//! Ping results are kept in a per-device ring buffer; alert states and
//! targets in plain maps. Useful for:
//! - Testing without database dependencies
//! - Deployments that only care about live events
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: Oldest results are evicted once a device's buffer is full

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::PingStatistics;
use crate::{AlertState, DeviceId, PingResult, PingTarget};

/// Maximum results kept in memory per device
const MAX_RESULTS_PER_DEVICE: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    results: HashMap<DeviceId, VecDeque<PingResult>>,
    alert_states: HashMap<DeviceId, AlertState>,
    targets: HashMap<DeviceId, PingTarget>,
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn save_ping_result(&self, result: &PingResult) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let buffer = state.results.entry(result.device_id.clone()).or_default();
        if buffer.len() >= MAX_RESULTS_PER_DEVICE {
            buffer.pop_front();
        }
        buffer.push_back(result.clone());
        Ok(())
    }

    async fn delete_ping_results_for_device(&self, device_id: &DeviceId) -> StorageResult<usize> {
        let removed = self
            .state
            .write()
            .await
            .results
            .remove(device_id)
            .map(|buffer| buffer.len())
            .unwrap_or(0);
        debug!(%device_id, "deleted {removed} in-memory ping results");
        Ok(removed)
    }

    async fn query_latest_results(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> StorageResult<Vec<PingResult>> {
        let state = self.state.read().await;
        let results = state
            .results
            .get(device_id)
            .map(|buffer| {
                let skip = buffer.len().saturating_sub(limit);
                buffer.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default();
        Ok(results)
    }

    async fn count_results(&self, device_id: &DeviceId) -> StorageResult<usize> {
        Ok(self
            .state
            .read()
            .await
            .results
            .get(device_id)
            .map_or(0, VecDeque::len))
    }

    async fn calculate_statistics(
        &self,
        device_id: &DeviceId,
        since: DateTime<Utc>,
    ) -> StorageResult<PingStatistics> {
        let state = self.state.read().await;
        let Some(buffer) = state.results.get(device_id) else {
            return Ok(PingStatistics::empty(device_id.clone()));
        };

        Ok(PingStatistics::from_results(
            device_id.clone(),
            buffer.iter().filter(|result| result.timestamp >= since),
        ))
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_results(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let mut deleted = 0;
        for buffer in state.results.values_mut() {
            let len = buffer.len();
            buffer.retain(|result| result.timestamp >= before);
            deleted += len - buffer.len();
        }
        state.results.retain(|_, buffer| !buffer.is_empty());
        debug!("deleted {deleted} old in-memory ping results");
        Ok(deleted)
    }

    async fn load_alert_state(&self, device_id: &DeviceId) -> StorageResult<Option<AlertState>> {
        Ok(self.state.read().await.alert_states.get(device_id).cloned())
    }

    async fn save_alert_state(&self, alert_state: &AlertState) -> StorageResult<()> {
        self.state
            .write()
            .await
            .alert_states
            .insert(alert_state.device_id.clone(), alert_state.clone());
        Ok(())
    }

    async fn delete_alert_state(&self, device_id: &DeviceId) -> StorageResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .alert_states
            .remove(device_id)
            .is_some())
    }

    async fn save_target(&self, target: &PingTarget) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if let Some(stored) = state.targets.get(&target.device_id) {
            if stored.version > target.version {
                return Err(StorageError::VersionConflict {
                    device_id: target.device_id.clone(),
                    stored: stored.version,
                    attempted: target.version,
                });
            }
        }
        state
            .targets
            .insert(target.device_id.clone(), target.clone());
        Ok(())
    }

    async fn load_targets(&self) -> StorageResult<Vec<PingTarget>> {
        Ok(self.state.read().await.targets.values().cloned().collect())
    }

    async fn delete_target(&self, device_id: &DeviceId) -> StorageResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .targets
            .remove(device_id)
            .is_some())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let state = self.state.read().await;
        let total: usize = state.results.values().map(VecDeque::len).sum();
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_results".to_string(), total.to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let state = self.state.read().await;
        let total: usize = state.results.values().map(VecDeque::len).sum();
        Ok(format!(
            "In-Memory: {} ping results across {} devices, {} alert states, {} targets",
            total,
            state.results.len(),
            state.alert_states.len(),
            state.targets.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
