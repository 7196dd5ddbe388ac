//! Concurrency and race condition tests
//!
//! These tests verify:
//! - The global probe ceiling holds under a large fleet
//! - Concurrent toggles publish exactly one event
//! - Cleanup racing an in-flight probe leaves no data behind

use std::sync::Arc;
use std::time::Duration;

use ping_monitoring::{DeviceId, PingTarget};
use ping_monitoring::events::RecordingSink;
use ping_monitoring::registry::TargetSpec;
use ping_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_ten_thousand_targets_respect_ceiling() {
    let prober = Arc::new(ScriptedProber::with_delay(true, Duration::from_millis(50)));
    let mut config = test_config(100);
    config.scheduler.max_concurrent_probes = 100;

    // seed the fleet through storage so it is restored in one registry write
    let storage = Arc::new(MemoryBackend::new());
    for i in 0..10_000 {
        let target = PingTarget::new(
            DeviceId::new(format!("device-{i}")),
            "198.51.100.1".parse().unwrap(),
            None,
            3600,
        )
        .with_monitored(true);
        storage.save_target(&target).await.unwrap();
    }

    let monitor = start_monitor(&config, storage, Arc::new(RecordingSink::new()), prober.clone()).await;

    // 100 probes per 100ms tick work through the fleet in about ten seconds
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert!(prober.max_in_flight() <= 100, "max in flight was {}", prober.max_in_flight());
    assert_eq!(prober.calls(), 10_000);

    let metrics = monitor.metrics().await.unwrap();
    assert_eq!(metrics.scheduler.completed, 10_000);
    assert_eq!(metrics.scheduler.in_flight, 0);
    assert_eq!(metrics.scheduler.max_concurrent, 100);
    assert!(metrics.scheduler.deferred > 0);
    assert_eq!(metrics.monitored_targets, 10_000);

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_start_monitoring_publishes_once() {
    let sink = Arc::new(RecordingSink::new());
    let monitor = Arc::new(
        start_monitor(
            &test_config(3_600_000),
            Arc::new(MemoryBackend::new()),
            sink.clone(),
            Arc::new(ScriptedProber::new(true)),
        )
        .await,
    );
    monitor
        .register_target(TargetSpec::new("shared", "198.51.100.2".parse().unwrap()))
        .await
        .unwrap();
    let id = DeviceId::new("shared");

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let monitor = monitor.clone();
            let id = id.clone();
            tokio::spawn(async move { monitor.start_monitoring(&id).await })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }

    assert_eq!(sink.count("monitoring_started"), 1);
    assert!(monitor.registry().contains_monitored(&id));

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deregister_during_in_flight_probe_leaves_no_data() {
    let storage = Arc::new(MemoryBackend::new());
    let sink = Arc::new(RecordingSink::new());
    let prober = Arc::new(ScriptedProber::with_delay(false, Duration::from_secs(2)));

    let monitor = start_monitor(&test_config(100), storage.clone(), sink.clone(), prober.clone()).await;
    let id = monitor_device(&monitor, "doomed", "198.51.100.3", 5).await;

    // let the first probe start
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(prober.calls(), 1);

    monitor.deregister_device(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(storage.count_results(&id).await.unwrap(), 0);
    assert_eq!(storage.load_alert_state(&id).await.unwrap(), None);
    assert!(storage.load_targets().await.unwrap().is_empty());
    assert_eq!(sink.count("ping_result_recorded"), 0);
    assert_eq!(prober.calls(), 1);

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_many_devices_keep_independent_alert_state() {
    let storage = Arc::new(MemoryBackend::new());
    let sink = Arc::new(RecordingSink::new());
    let prober = Arc::new(ScriptedProber::new(true));
    for i in 0..20 {
        if i % 2 == 0 {
            prober.script(&format!("dev-{i}"), &[false, false, false]);
        }
    }

    let monitor = start_monitor(&test_config(100), storage.clone(), sink.clone(), prober).await;
    for i in 0..20 {
        monitor_device(&monitor, &format!("dev-{i}"), "198.51.100.4", 5).await;
    }

    tokio::time::sleep(Duration::from_secs(12)).await;

    assert_eq!(sink.count("device_down"), 10);
    for i in 0..20 {
        let state = storage
            .load_alert_state(&DeviceId::new(format!("dev-{i}")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.alert_active, i % 2 == 0, "dev-{i}");
    }

    monitor.shutdown().await.unwrap();
}
