//! End-to-end tests: scheduler → prober → orchestrator → storage and events
//!
//! These run on a paused tokio clock so probe timing is exact.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use ping_monitoring::events::{MonitoringEvent, RecordingSink};
use ping_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_device_goes_down_and_recovers() {
    let storage = Arc::new(MemoryBackend::new());
    let sink = Arc::new(RecordingSink::new());
    let prober = Arc::new(ScriptedProber::new(true));
    prober.script("router", &[false, false, false, true, true]);

    let monitor = start_monitor(&test_config(100), storage.clone(), sink.clone(), prober.clone()).await;
    let id = monitor_device(&monitor, "router", "192.0.2.10", 5).await;

    // probes land at roughly t=0, 5, 10, 15 and 20
    tokio::time::sleep(Duration::from_secs(22)).await;

    assert_eq!(prober.calls(), 5);
    assert_eq!(storage.count_results(&id).await.unwrap(), 5);

    let kinds: Vec<_> = kinds_for(&sink, &id)
        .into_iter()
        .filter(|kind| *kind != "monitoring_started")
        .collect();
    assert_eq!(kinds, vec![
        "ping_result_recorded",
        "ping_result_recorded",
        "ping_result_recorded",
        "device_down",
        "ping_result_recorded",
        "ping_result_recorded",
        "device_recovered",
    ]);

    // the down event belongs to the third probe (t=10), the recovery to the fifth (t=20)
    let results = storage.query_latest_results(&id, 10).await.unwrap();
    let transitions: Vec<_> = sink
        .events_for(&id)
        .into_iter()
        .filter_map(|event| match event {
            MonitoringEvent::DeviceDown { timestamp, .. } => Some(("device_down", timestamp)),
            MonitoringEvent::DeviceRecovered { timestamp, .. } => Some(("device_recovered", timestamp)),
            _ => None,
        })
        .collect();
    assert_eq!(transitions, vec![
        ("device_down", results[2].timestamp),
        ("device_recovered", results[4].timestamp),
    ]);
    assert_eq!(
        results.iter().map(|result| result.success).collect::<Vec<_>>(),
        vec![false, false, false, true, true]
    );

    let state = monitor.alert_state(&id).await.unwrap().unwrap();
    assert!(!state.alert_active);
    assert_eq!(state.last_alert_sent, Some(results[2].timestamp));
    assert_eq!(state.last_recovery_sent, Some(results[4].timestamp));
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.consecutive_successes, 2);

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_down_event_carries_probed_address() {
    let sink = Arc::new(RecordingSink::new());
    let prober = Arc::new(ScriptedProber::new(false));

    let monitor = start_monitor(
        &test_config(100),
        Arc::new(MemoryBackend::new()),
        sink.clone(),
        prober,
    )
    .await;
    let id = monitor_device(&monitor, "switch", "192.0.2.20", 5).await;

    tokio::time::sleep(Duration::from_secs(12)).await;

    let down: Vec<_> = sink
        .events_for(&id)
        .into_iter()
        .filter_map(|event| match event {
            MonitoringEvent::DeviceDown { address, .. } => Some(address),
            _ => None,
        })
        .collect();
    assert_eq!(down, vec!["192.0.2.20".to_string()]);

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_statistics_and_recent_results() {
    let prober = Arc::new(ScriptedProber::new(true));
    prober.script("ap", &[true, false, true, true]);

    let monitor = start_monitor(
        &test_config(100),
        Arc::new(MemoryBackend::new()),
        Arc::new(RecordingSink::new()),
        prober,
    )
    .await;
    let id = monitor_device(&monitor, "ap", "192.0.2.30", 5).await;

    tokio::time::sleep(Duration::from_secs(17)).await;

    let stats = monitor
        .statistics(&id, Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(stats.total_samples, 4);
    assert_eq!(stats.successful, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 75.0);

    let recent = monitor.recent_results(&id, 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|result| result.success));

    monitor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopping_monitoring_halts_probes() {
    let prober = Arc::new(ScriptedProber::new(true));
    let monitor = start_monitor(
        &test_config(100),
        Arc::new(MemoryBackend::new()),
        Arc::new(RecordingSink::new()),
        prober.clone(),
    )
    .await;
    let id = monitor_device(&monitor, "nas", "192.0.2.40", 5).await;

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(prober.calls(), 2);

    monitor.stop_monitoring(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(prober.calls(), 2);

    // restarting probes immediately rather than waiting out the old interval
    monitor.start_monitoring(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(prober.calls(), 3);

    monitor.shutdown().await.unwrap();
}
