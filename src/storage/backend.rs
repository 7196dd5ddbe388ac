//! Storage backend trait definition
//!
//! This module defines the persistence boundary of the engine: append-only
//! ping results, per-device alert state, and the registered targets.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::PingStatistics;
use crate::{AlertState, DeviceId, PingResult, PingTarget};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// Implementations must be `Send + Sync`; the orchestrator calls them from
/// many probe tasks at once. Calls for the same device are already serialized
/// by the caller, calls for different devices are not.
///
/// Methods return `StorageResult<T>`; implementations convert backend-specific
/// errors into `StorageError` variants.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Ping results
    // ========================================================================

    /// Append one ping result
    async fn save_ping_result(&self, result: &PingResult) -> StorageResult<()>;

    /// Delete every stored result of a device, returning how many were removed
    async fn delete_ping_results_for_device(&self, device_id: &DeviceId) -> StorageResult<usize>;

    /// The `limit` most recent results of a device, oldest first
    async fn query_latest_results(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> StorageResult<Vec<PingResult>>;

    /// Number of stored results for a device
    async fn count_results(&self, device_id: &DeviceId) -> StorageResult<usize>;

    /// Success rate and latency of a device since `since`
    async fn calculate_statistics(
        &self,
        device_id: &DeviceId,
        since: DateTime<Utc>,
    ) -> StorageResult<PingStatistics>;

    /// Delete results older than `before` (retention); returns the number deleted
    async fn cleanup_old_results(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    // ========================================================================
    // Alert state
    // ========================================================================

    async fn load_alert_state(&self, device_id: &DeviceId) -> StorageResult<Option<AlertState>>;

    /// Insert or replace the alert state of `state.device_id`
    async fn save_alert_state(&self, state: &AlertState) -> StorageResult<()>;

    /// Returns whether a state existed
    async fn delete_alert_state(&self, device_id: &DeviceId) -> StorageResult<bool>;

    // ========================================================================
    // Targets
    // ========================================================================

    /// Insert or update a target
    ///
    /// Fails with `StorageError::VersionConflict` when the stored target has a
    /// newer version than `target.version`.
    async fn save_target(&self, target: &PingTarget) -> StorageResult<()>;

    async fn load_targets(&self) -> StorageResult<Vec<PingTarget>>;

    /// Returns whether a target existed
    async fn delete_target(&self, device_id: &DeviceId) -> StorageResult<bool>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Lightweight check that the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable stats about the backend
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
