//! Device change feed tests: wire JSON → DeviceChange → registry

use std::sync::Arc;
use std::time::Duration;

use ping_monitoring::DeviceId;
use ping_monitoring::events::{MonitoringEvent, RecordingSink};
use ping_monitoring::feed::DeviceChange;
use ping_monitoring::monitor::PingMonitor;
use ping_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

async fn apply(monitor: &PingMonitor, line: &str) {
    let change = DeviceChange::from_json(line)
        .expect("valid device change")
        .expect("handled event type");
    monitor.apply_device_change(change).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_feed_lifecycle() {
    let storage = Arc::new(MemoryBackend::new());
    let sink = Arc::new(RecordingSink::new());
    let prober = Arc::new(ScriptedProber::new(true));
    let monitor = start_monitor(&test_config(100), storage.clone(), sink.clone(), prober.clone()).await;
    let id = DeviceId::new("6f1c2a");

    apply(
        &monitor,
        r#"{"eventType":"device.created","payload":{"deviceId":"6f1c2a","deviceName":"core switch","ipAddress":"203.0.113.5","monitored":true}}"#,
    )
    .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(prober.calls(), 1);
    assert_eq!(storage.count_results(&id).await.unwrap(), 1);

    apply(
        &monitor,
        r#"{"eventType":"device.updated","payload":{"deviceId":"6f1c2a","ipAddress":{"old":"203.0.113.5","new":"203.0.113.9"}}}"#,
    )
    .await;
    let target = monitor.registry().get(&id).unwrap();
    assert_eq!(target.probe_address(), "203.0.113.9");
    assert!(target.monitored);

    let moved: Vec<_> = sink
        .events_for(&id)
        .into_iter()
        .filter_map(|event| match event {
            MonitoringEvent::TargetAddressChanged {
                previous_address,
                address,
                ..
            } => Some((previous_address, address)),
            _ => None,
        })
        .collect();
    assert_eq!(moved, vec![("203.0.113.5".to_string(), "203.0.113.9".to_string())]);

    apply(
        &monitor,
        r#"{"eventType":"device.deleted","payload":{"deviceId":"6f1c2a"}}"#,
    )
    .await;
    assert!(monitor.registry().get(&id).is_none());
    assert_eq!(storage.count_results(&id).await.unwrap(), 0);
    assert_eq!(storage.load_alert_state(&id).await.unwrap(), None);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(prober.calls(), 1);

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_for_unknown_device_creates_unmonitored_target() {
    let monitor = start_monitor(
        &test_config(3_600_000),
        Arc::new(MemoryBackend::new()),
        Arc::new(RecordingSink::new()),
        Arc::new(ScriptedProber::new(true)),
    )
    .await;

    apply(
        &monitor,
        r#"{"eventType":"device.updated","payload":{"deviceId":"late","ipAddress":"203.0.113.7","hostname":{"old":null,"new":"late.lan"}}}"#,
    )
    .await;

    let target = monitor.registry().get(&DeviceId::new("late")).unwrap();
    assert!(!target.monitored);
    assert_eq!(target.probe_address(), "late.lan");

    // an address-less update for a device nobody knows is ignored
    apply(
        &monitor,
        r#"{"eventType":"device.updated","payload":{"deviceId":"nobody","hostname":"x.lan"}}"#,
    )
    .await;
    assert!(monitor.registry().get(&DeviceId::new("nobody")).is_none());

    monitor.shutdown().await.unwrap();
}
