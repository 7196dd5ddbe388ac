//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `StorageBackend` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds, so values read back are
//! truncated to millisecond precision.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::PingStatistics;
use crate::{AlertState, DeviceId, PingResult, PingTarget};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for WAL mode and relaxed fsync
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use ping_monitoring::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./ping-monitoring.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {millis}")))
    }

    fn optional_timestamp(row: &SqliteRow, column: &str) -> StorageResult<Option<DateTime<Utc>>> {
        row.try_get::<Option<i64>, _>(column)?
            .map(Self::millis_to_timestamp)
            .transpose()
    }

    fn counter(row: &SqliteRow, column: &str) -> StorageResult<u32> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value)
            .map_err(|_| StorageError::Corrupt(format!("{column} out of range: {value}")))
    }

    fn row_to_result(row: &SqliteRow) -> StorageResult<PingResult> {
        Ok(PingResult {
            device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
            address: row.try_get("address")?,
            success: row.try_get("success")?,
            response_time_ms: row.try_get("response_time_ms")?,
            error_message: row.try_get("error_message")?,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?)?,
        })
    }

    fn row_to_alert_state(row: &SqliteRow) -> StorageResult<AlertState> {
        Ok(AlertState {
            device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
            alert_active: row.try_get("alert_active")?,
            consecutive_failures: Self::counter(row, "consecutive_failures")?,
            consecutive_successes: Self::counter(row, "consecutive_successes")?,
            last_alert_sent: Self::optional_timestamp(row, "last_alert_sent")?,
            last_recovery_sent: Self::optional_timestamp(row, "last_recovery_sent")?,
            last_failure_time: Self::optional_timestamp(row, "last_failure_time")?,
            last_success_time: Self::optional_timestamp(row, "last_success_time")?,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?)?,
            updated_at: Self::millis_to_timestamp(row.try_get("updated_at")?)?,
        })
    }

    fn row_to_target(row: &SqliteRow) -> StorageResult<PingTarget> {
        let ip: String = row.try_get("ip_address")?;
        let version: i64 = row.try_get("version")?;

        Ok(PingTarget {
            device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
            ip_address: ip
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("invalid ip address: {ip}")))?,
            hostname: row.try_get("hostname")?,
            monitored: row.try_get("monitored")?,
            interval_secs: Self::counter(row, "interval_secs")?,
            version: u64::try_from(version)
                .map_err(|_| StorageError::Corrupt(format!("invalid version: {version}")))?,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?)?,
            updated_at: Self::millis_to_timestamp(row.try_get("updated_at")?)?,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, result), fields(device_id = %result.device_id))]
    async fn save_ping_result(&self, result: &PingResult) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ping_results (
                device_id, address, success, response_time_ms, error_message, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.device_id.as_str())
        .bind(&result.address)
        .bind(result.success)
        .bind(result.response_time_ms)
        .bind(&result.error_message)
        .bind(Self::timestamp_to_millis(&result.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn delete_ping_results_for_device(&self, device_id: &DeviceId) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM ping_results WHERE device_id = ?")
            .bind(device_id.as_str())
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        debug!("deleted {deleted} ping results");
        Ok(deleted)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn query_latest_results(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> StorageResult<Vec<PingResult>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, address, success, response_time_ms, error_message, timestamp
            FROM ping_results
            WHERE device_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut results = rows
            .iter()
            .map(Self::row_to_result)
            .collect::<StorageResult<Vec<_>>>()?;
        // Reverse to get chronological order (oldest first)
        results.reverse();
        Ok(results)
    }

    async fn count_results(&self, device_id: &DeviceId) -> StorageResult<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ping_results WHERE device_id = ?")
            .bind(device_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as usize)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn calculate_statistics(
        &self,
        device_id: &DeviceId,
        since: DateTime<Utc>,
    ) -> StorageResult<PingStatistics> {
        let since_millis = Self::timestamp_to_millis(&since);

        let aggregate = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(success), 0) AS successful,
                AVG(CASE WHEN success = 1 THEN response_time_ms END) AS average_rtt
            FROM ping_results
            WHERE device_id = ? AND timestamp >= ?
            "#,
        )
        .bind(device_id.as_str())
        .bind(since_millis)
        .fetch_one(&self.pool)
        .await?;

        let last = sqlx::query(
            r#"
            SELECT device_id, address, success, response_time_ms, error_message, timestamp
            FROM ping_results
            WHERE device_id = ? AND timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id.as_str())
        .bind(since_millis)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(Self::row_to_result)
        .transpose()?;

        let total: i64 = aggregate.try_get("total")?;
        let successful: i64 = aggregate.try_get("successful")?;

        Ok(PingStatistics::from_counts(
            device_id.clone(),
            total.max(0) as u64,
            successful.max(0) as u64,
            aggregate.try_get("average_rtt")?,
            last,
        ))
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_results(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        info!("cleaning up ping results older than {}", before);

        let result = sqlx::query("DELETE FROM ping_results WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old ping results", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn load_alert_state(&self, device_id: &DeviceId) -> StorageResult<Option<AlertState>> {
        sqlx::query(
            r#"
            SELECT device_id, alert_active, consecutive_failures, consecutive_successes,
                   last_alert_sent, last_recovery_sent, last_failure_time, last_success_time,
                   created_at, updated_at
            FROM alert_states
            WHERE device_id = ?
            "#,
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(Self::row_to_alert_state)
        .transpose()
    }

    #[instrument(skip(self, state), fields(device_id = %state.device_id))]
    async fn save_alert_state(&self, state: &AlertState) -> StorageResult<()> {
        let millis = |dt: &Option<DateTime<Utc>>| dt.as_ref().map(Self::timestamp_to_millis);

        sqlx::query(
            r#"
            INSERT INTO alert_states (
                device_id, alert_active, consecutive_failures, consecutive_successes,
                last_alert_sent, last_recovery_sent, last_failure_time, last_success_time,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                alert_active = excluded.alert_active,
                consecutive_failures = excluded.consecutive_failures,
                consecutive_successes = excluded.consecutive_successes,
                last_alert_sent = excluded.last_alert_sent,
                last_recovery_sent = excluded.last_recovery_sent,
                last_failure_time = excluded.last_failure_time,
                last_success_time = excluded.last_success_time,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.device_id.as_str())
        .bind(state.alert_active)
        .bind(i64::from(state.consecutive_failures))
        .bind(i64::from(state.consecutive_successes))
        .bind(millis(&state.last_alert_sent))
        .bind(millis(&state.last_recovery_sent))
        .bind(millis(&state.last_failure_time))
        .bind(millis(&state.last_success_time))
        .bind(Self::timestamp_to_millis(&state.created_at))
        .bind(Self::timestamp_to_millis(&state.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn delete_alert_state(&self, device_id: &DeviceId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM alert_states WHERE device_id = ?")
            .bind(device_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, target), fields(device_id = %target.device_id, version = target.version))]
    async fn save_target(&self, target: &PingTarget) -> StorageResult<()> {
        let version = i64::try_from(target.version)
            .map_err(|_| StorageError::InvalidConfig(format!("version {} too large", target.version)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO ping_targets (
                device_id, ip_address, hostname, monitored, interval_secs,
                version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                ip_address = excluded.ip_address,
                hostname = excluded.hostname,
                monitored = excluded.monitored,
                interval_secs = excluded.interval_secs,
                version = excluded.version,
                updated_at = excluded.updated_at
            WHERE excluded.version >= ping_targets.version
            "#,
        )
        .bind(target.device_id.as_str())
        .bind(target.ip_address.to_string())
        .bind(&target.hostname)
        .bind(target.monitored)
        .bind(i64::from(target.interval_secs))
        .bind(version)
        .bind(Self::timestamp_to_millis(&target.created_at))
        .bind(Self::timestamp_to_millis(&target.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let stored: (i64,) =
                sqlx::query_as("SELECT version FROM ping_targets WHERE device_id = ?")
                    .bind(target.device_id.as_str())
                    .fetch_one(&self.pool)
                    .await?;
            warn!(stored = stored.0, "rejected stale target write");
            return Err(StorageError::VersionConflict {
                device_id: target.device_id.clone(),
                stored: stored.0.max(0) as u64,
                attempted: target.version,
            });
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_targets(&self) -> StorageResult<Vec<PingTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, ip_address, hostname, monitored, interval_secs,
                   version, created_at, updated_at
            FROM ping_targets
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let targets = rows
            .iter()
            .map(Self::row_to_target)
            .collect::<StorageResult<Vec<_>>>()?;
        debug!("loaded {} persisted targets", targets.len());
        Ok(targets)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn delete_target(&self, device_id: &DeviceId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM ping_targets WHERE device_id = ?")
            .bind(device_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let results: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ping_results")
            .fetch_one(&self.pool)
            .await?;
        let targets: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ping_targets")
            .fetch_one(&self.pool)
            .await?;
        let range: (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(timestamp), MAX(timestamp) FROM ping_results")
                .fetch_one(&self.pool)
                .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        let time_range = match range {
            (Some(oldest), Some(newest)) => format!(
                "{} to {}",
                Self::millis_to_timestamp(oldest)?.format("%Y-%m-%d"),
                Self::millis_to_timestamp(newest)?.format("%Y-%m-%d")
            ),
            _ => "no data".to_string(),
        };

        Ok(format!(
            "SQLite: {} ping results, {} targets, {:.2} MB on disk, time range: {}",
            results.0, targets.0, file_size_mb, time_range
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
