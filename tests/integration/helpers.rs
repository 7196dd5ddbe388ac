//! Helper types and functions for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ping_monitoring::config::MonitoringConfig;
use ping_monitoring::events::RecordingSink;
use ping_monitoring::monitor::PingMonitor;
use ping_monitoring::probe::Prober;
use ping_monitoring::registry::TargetSpec;
use ping_monitoring::storage::{
    HealthStatus, MemoryBackend, PingStatistics, StorageBackend, StorageError, StorageResult,
};
use ping_monitoring::{AlertState, DeviceId, PingResult, PingTarget};

/// Prober that replays a per-device script of outcomes
///
/// Once a device's script runs out, `default_success` decides the outcome.
/// Tracks how many probes are running at once.
pub struct ScriptedProber {
    scripts: Mutex<HashMap<DeviceId, VecDeque<bool>>>,
    default_success: AtomicBool,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(default_success: bool) -> Self {
        Self::with_delay(default_success, Duration::ZERO)
    }

    pub fn with_delay(default_success: bool, delay: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_success: AtomicBool::new(default_success),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, device_id: &str, outcomes: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(DeviceId::new(device_id), outcomes.iter().copied().collect());
    }

    pub fn set_default(&self, success: bool) {
        self.default_success.store(success, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, device_id: &DeviceId) -> bool {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(device_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_success.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, target: &PingTarget) -> PingResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let success = self.next_outcome(&target.device_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if success {
            PingResult::success(target.device_id.clone(), target.probe_address(), 2.5, Utc::now())
        } else {
            PingResult::failure(
                target.device_id.clone(),
                target.probe_address(),
                "request timed out",
                Utc::now(),
            )
        }
    }
}

/// Memory backend whose writes can be switched to fail
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
    targets_failing: AtomicBool,
}

impl FlakyBackend {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail target writes only, leaving results and alert state alone
    pub fn set_targets_failing(&self, failing: bool) {
        self.targets_failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk on fire".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn save_ping_result(&self, result: &PingResult) -> StorageResult<()> {
        self.check()?;
        self.inner.save_ping_result(result).await
    }

    async fn delete_ping_results_for_device(&self, device_id: &DeviceId) -> StorageResult<usize> {
        self.inner.delete_ping_results_for_device(device_id).await
    }

    async fn query_latest_results(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> StorageResult<Vec<PingResult>> {
        self.inner.query_latest_results(device_id, limit).await
    }

    async fn count_results(&self, device_id: &DeviceId) -> StorageResult<usize> {
        self.inner.count_results(device_id).await
    }

    async fn calculate_statistics(
        &self,
        device_id: &DeviceId,
        since: DateTime<Utc>,
    ) -> StorageResult<PingStatistics> {
        self.inner.calculate_statistics(device_id, since).await
    }

    async fn cleanup_old_results(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.cleanup_old_results(before).await
    }

    async fn load_alert_state(&self, device_id: &DeviceId) -> StorageResult<Option<AlertState>> {
        self.inner.load_alert_state(device_id).await
    }

    async fn save_alert_state(&self, state: &AlertState) -> StorageResult<()> {
        self.check()?;
        self.inner.save_alert_state(state).await
    }

    async fn delete_alert_state(&self, device_id: &DeviceId) -> StorageResult<bool> {
        self.inner.delete_alert_state(device_id).await
    }

    async fn save_target(&self, target: &PingTarget) -> StorageResult<()> {
        if self.targets_failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("target table locked".to_string()));
        }
        self.inner.save_target(target).await
    }

    async fn load_targets(&self) -> StorageResult<Vec<PingTarget>> {
        self.inner.load_targets().await
    }

    async fn delete_target(&self, device_id: &DeviceId) -> StorageResult<bool> {
        self.inner.delete_target(device_id).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }

    async fn get_stats(&self) -> StorageResult<String> {
        self.inner.get_stats().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

/// Default engine configuration with the given scheduler tick
pub fn test_config(tick_interval_ms: u64) -> MonitoringConfig {
    let mut config = MonitoringConfig::default();
    config.scheduler.tick_interval_ms = tick_interval_ms;
    config
}

pub async fn start_monitor(
    config: &MonitoringConfig,
    storage: Arc<dyn StorageBackend>,
    sink: Arc<RecordingSink>,
    prober: Arc<ScriptedProber>,
) -> PingMonitor {
    PingMonitor::start(config, storage, sink, prober)
        .await
        .expect("monitor should start")
}

/// Register a target and start monitoring it
pub async fn monitor_device(monitor: &PingMonitor, id: &str, ip: &str, interval_secs: u32) -> DeviceId {
    monitor
        .register_target(TargetSpec::new(id, ip.parse().unwrap()).with_interval(interval_secs))
        .await
        .unwrap();
    let device_id = DeviceId::new(id);
    monitor.start_monitoring(&device_id).await.unwrap();
    device_id
}

/// Event kinds recorded for one device, in publication order
pub fn kinds_for(sink: &RecordingSink, device_id: &DeviceId) -> Vec<&'static str> {
    sink.events_for(device_id)
        .iter()
        .map(|event| event.kind())
        .collect()
}
