//! Persistence tests against the SQLite backend
//!
//! These run on the real clock; the pool's worker threads do not follow a
//! paused tokio clock.

use std::sync::Arc;
use std::time::Duration;

use ping_monitoring::DeviceId;
use ping_monitoring::events::RecordingSink;
use ping_monitoring::storage::StorageBackend;
use ping_monitoring::storage::sqlite::SqliteBackend;
use tempfile::TempDir;

use crate::helpers::*;

async fn open(dir: &TempDir) -> Arc<SqliteBackend> {
    Arc::new(
        SqliteBackend::new(dir.path().join("ping.db"))
            .await
            .expect("sqlite backend should open"),
    )
}

#[tokio::test]
async fn test_targets_and_results_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let prober = Arc::new(ScriptedProber::new(false));
    let mut config = test_config(50);
    config.alerting.failure_threshold = 1;

    let storage = open(&dir).await;
    let monitor = start_monitor(&config, storage.clone(), Arc::new(RecordingSink::new()), prober.clone()).await;
    let id = monitor_device(&monitor, "persisted", "192.0.2.99", 1).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    monitor.shutdown().await.unwrap();

    let recorded = prober.calls();
    assert!(recorded >= 1);

    // a fresh engine on the same file picks everything back up
    let storage = open(&dir).await;
    assert!(storage.count_results(&id).await.unwrap() >= 1);
    let state = storage.load_alert_state(&id).await.unwrap().unwrap();
    assert!(state.alert_active);

    let sink = Arc::new(RecordingSink::new());
    let monitor = start_monitor(&config, storage.clone(), sink, Arc::new(ScriptedProber::new(true))).await;
    let target = monitor.registry().get(&id).unwrap();
    assert!(target.monitored);
    assert_eq!(target.interval_secs, 1);

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deregister_clears_persisted_data() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open(&dir).await;
    let prober = Arc::new(ScriptedProber::new(true));

    let monitor = start_monitor(&test_config(50), storage.clone(), Arc::new(RecordingSink::new()), prober.clone()).await;
    let id = monitor_device(&monitor, "short-lived", "192.0.2.98", 1).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(prober.calls() >= 1);

    monitor.deregister_device(&id).await.unwrap();

    assert_eq!(storage.count_results(&id).await.unwrap(), 0);
    assert_eq!(storage.load_alert_state(&id).await.unwrap(), None);
    assert!(storage.load_targets().await.unwrap().is_empty());
    assert!(monitor.registry().get(&DeviceId::new("short-lived")).is_none());

    monitor.shutdown().await.unwrap();
}
