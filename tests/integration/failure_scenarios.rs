//! Failure scenario tests
//!
//! - Storage outages do not stop the scheduler
//! - Persistently failing devices trip the circuit breaker
//! - Administrative breaker resets resume probing
//! - Failed target writes leave nothing half-applied

use std::sync::Arc;
use std::time::Duration;

use ping_monitoring::DeviceId;
use ping_monitoring::breaker::BreakerState;
use ping_monitoring::events::RecordingSink;
use ping_monitoring::registry::TargetSpec;
use ping_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_storage_outage_does_not_stop_scheduler() {
    let storage = Arc::new(FlakyBackend::default());
    let sink = Arc::new(RecordingSink::new());
    let prober = Arc::new(ScriptedProber::new(true));

    let monitor = start_monitor(&test_config(100), storage.clone(), sink.clone(), prober.clone()).await;
    let id = monitor_device(&monitor, "db-down", "192.0.2.50", 5).await;

    storage.set_failing(true);
    tokio::time::sleep(Duration::from_secs(12)).await;

    assert_eq!(prober.calls(), 3);
    assert_eq!(storage.count_results(&id).await.unwrap(), 0);
    assert_eq!(sink.count("ping_result_recorded"), 0);

    storage.set_failing(false);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(prober.calls(), 4);
    assert_eq!(storage.count_results(&id).await.unwrap(), 1);
    assert_eq!(sink.count("ping_result_recorded"), 1);

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_device_trips_breaker() {
    let sink = Arc::new(RecordingSink::new());
    let prober = Arc::new(ScriptedProber::new(false));
    let config = test_config(100);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);

    let monitor = start_monitor(&config, Arc::new(MemoryBackend::new()), sink.clone(), prober.clone()).await;
    let id = monitor_device(&monitor, "dead", "192.0.2.60", 5).await;

    // five failures at t=0..20 open the breaker, the open duration is 300s
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(prober.calls(), 5);
    assert_eq!(monitor.breaker().state(&id), BreakerState::Open);
    assert_eq!(sink.count("device_down"), 1);

    let metrics = monitor.metrics().await.unwrap();
    assert_eq!(metrics.breaker.open, 1);
    assert!(metrics.breaker.skipped_probes >= 7);
    assert_eq!(metrics.scheduler.breaker_skips, metrics.breaker.skipped_probes);

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trial_probe_after_open_duration() {
    let prober = Arc::new(ScriptedProber::new(false));
    let mut config = test_config(100);
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.open_duration_secs = 30;

    let monitor = start_monitor(
        &config,
        Arc::new(MemoryBackend::new()),
        Arc::new(RecordingSink::new()),
        prober.clone(),
    )
    .await;
    let id = monitor_device(&monitor, "flappy", "192.0.2.70", 5).await;

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(prober.calls(), 2);
    assert_eq!(monitor.breaker().state(&id), BreakerState::Open);

    // the device comes back, but the breaker holds until the open duration ends (~t=35)
    prober.set_default(true);
    tokio::time::sleep(Duration::from_secs(27)).await;
    assert_eq!(prober.calls(), 2);
    assert_eq!(monitor.breaker().state(&id), BreakerState::Open);

    // exactly one trial, which closes the breaker
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(prober.calls(), 3);
    assert_eq!(monitor.breaker().state(&id), BreakerState::Closed);

    // regular probing resumes on the next interval (~t=40)
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(prober.calls(), 4);

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reset_breaker_resumes_probing() {
    let prober = Arc::new(ScriptedProber::new(false));
    let mut config = test_config(100);
    config.circuit_breaker.failure_threshold = 1;

    let monitor = start_monitor(
        &config,
        Arc::new(MemoryBackend::new()),
        Arc::new(RecordingSink::new()),
        prober.clone(),
    )
    .await;
    let id = monitor_device(&monitor, "lab", "192.0.2.80", 5).await;

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(prober.calls(), 1);

    monitor.reset_breaker(&id);
    assert_eq!(monitor.breaker().state(&id), BreakerState::Closed);

    // the skip at t=10 counted as this interval's probe, the next one is at t=15
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(prober.calls(), 2);

    monitor.clear_all_breakers();
    assert_eq!(monitor.metrics().await.unwrap().breaker.total_devices, 0);

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_device_operations_fail_cleanly() {
    let monitor = start_monitor(
        &test_config(100),
        Arc::new(MemoryBackend::new()),
        Arc::new(RecordingSink::new()),
        Arc::new(ScriptedProber::new(true)),
    )
    .await;
    let ghost = DeviceId::new("ghost");

    assert!(monitor.start_monitoring(&ghost).await.is_err());
    assert!(monitor.stop_monitoring(&ghost).await.is_err());
    assert!(monitor.deregister_device(&ghost).await.is_ok());

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_target_writes_can_be_retried() {
    let storage = Arc::new(FlakyBackend::default());
    let sink = Arc::new(RecordingSink::new());
    let monitor = start_monitor(
        &test_config(3_600_000),
        storage.clone(),
        sink.clone(),
        Arc::new(ScriptedProber::new(true)),
    )
    .await;
    let id = DeviceId::new("retry");
    let spec = || TargetSpec::new("retry", "192.0.2.90".parse().unwrap());

    storage.set_targets_failing(true);
    assert!(monitor.register_target(spec()).await.is_err());
    assert!(monitor.registry().get(&id).is_none());

    storage.set_targets_failing(false);
    monitor.register_target(spec()).await.unwrap();
    assert_eq!(storage.load_targets().await.unwrap().len(), 1);

    storage.set_targets_failing(true);
    assert!(monitor.start_monitoring(&id).await.is_err());
    assert!(!monitor.registry().contains_monitored(&id));
    assert_eq!(sink.count("monitoring_started"), 0);

    storage.set_targets_failing(false);
    monitor.start_monitoring(&id).await.unwrap();
    assert_eq!(sink.count("monitoring_started"), 1);
    assert!(storage.load_targets().await.unwrap()[0].monitored);

    storage.set_targets_failing(true);
    assert!(monitor.stop_monitoring(&id).await.is_err());
    assert!(monitor.registry().contains_monitored(&id));
    assert_eq!(sink.count("monitoring_stopped"), 0);

    storage.set_targets_failing(false);
    monitor.stop_monitoring(&id).await.unwrap();
    assert_eq!(sink.count("monitoring_stopped"), 1);
    assert!(!storage.load_targets().await.unwrap()[0].monitored);

    monitor.shutdown().await.unwrap();
}
