use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use ping_monitoring::{
    config::{Config, StorageConfig, TargetConfig, read_config_file},
    events::BroadcastSink,
    feed::DeviceChange,
    monitor::PingMonitor,
    probe::build_prober,
    registry::TargetSpec,
    storage::open_storage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_CHANNEL_CAPACITY: usize = 4096;
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, long, env = "PING_MONITOR_CONFIG")]
    file: PathBuf,

    /// Read device change notifications as JSON lines from stdin
    #[arg(long)]
    device_feed: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("ping_monitoring", LevelFilter::DEBUG),
        ("ping_monitor", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)
        .with_context(|| format!("failed to load config from {}", args.file.display()))?;

    let storage = open_storage(config.storage.as_ref())
        .await
        .context("failed to open storage backend")?;
    info!("{}", storage.get_stats().await?);

    let sink = Arc::new(BroadcastSink::new(EVENT_CHANNEL_CAPACITY));
    tokio::spawn(log_events(sink.clone()));

    let prober = build_prober(&config.monitoring.probe);
    let monitor = Arc::new(
        PingMonitor::start(&config.monitoring, storage, sink, prober)
            .await
            .context("failed to start ping monitor")?,
    );

    register_static_targets(&monitor, &config).await;

    if let Some(StorageConfig::Sqlite { retention_days, .. }) = &config.storage {
        tokio::spawn(retention_sweep(monitor.clone(), *retention_days));
    }

    if args.device_feed {
        tokio::spawn(consume_device_feed(monitor.clone()));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    monitor.shutdown().await?;
    Ok(())
}

async fn register_static_targets(monitor: &PingMonitor, config: &Config) {
    let registrations = config.targets.iter().map(|target| register_static_target(monitor, target));
    futures::future::join_all(registrations).await;
    info!(count = config.targets.len(), "static targets registered");
}

async fn register_static_target(monitor: &PingMonitor, target: &TargetConfig) {
    let mut spec = TargetSpec::new(target.device_id.as_str(), target.ip);
    if let Some(hostname) = &target.hostname {
        spec = spec.with_hostname(hostname.as_str());
    }
    if let Some(interval) = target.interval {
        spec = spec.with_interval(interval);
    }

    let registered = match monitor.register_target(spec).await {
        Ok(registered) => registered,
        Err(e) => {
            error!(device_id = %target.device_id, "failed to register target: {e}");
            return;
        }
    };

    let result = if target.monitored {
        monitor.start_monitoring(&registered.device_id).await
    } else {
        monitor.stop_monitoring(&registered.device_id).await
    };
    if let Err(e) = result {
        error!(device_id = %target.device_id, "failed to apply monitoring state: {e}");
    }
}

async fn log_events(sink: Arc<BroadcastSink>) {
    let mut events = sink.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!(target: "ping_monitor::events", "{json}"),
                Err(e) => warn!("failed to serialize {} event: {e}", event.kind()),
            },
            Err(RecvError::Lagged(missed)) => warn!("event logger lagged, missed {missed} events"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn retention_sweep(monitor: Arc<PingMonitor>, retention_days: u32) {
    let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;

        let before = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        match monitor.purge_results_before(before).await {
            Ok(deleted) => info!(deleted, retention_days, "retention sweep finished"),
            Err(e) => error!("retention sweep failed: {e}"),
        }
    }
}

async fn consume_device_feed(monitor: Arc<PingMonitor>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("device feed closed");
                break;
            }
            Err(e) => {
                error!("failed to read device feed: {e}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let change = match DeviceChange::from_json(&line) {
            Ok(Some(change)) => change,
            Ok(None) => continue,
            Err(e) => {
                warn!("skipping device change: {e}");
                continue;
            }
        };

        let device_id = change.device_id().clone();
        if let Err(e) = monitor.apply_device_change(change).await {
            error!(%device_id, "failed to apply device change: {e}");
        }
    }
}
