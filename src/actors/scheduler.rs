//! SchedulerActor - decides which targets to probe and dispatches the probes
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → due targets → permit? → breaker allows? → spawn probe task → orchestrator
//!     ↑                         │ no          │ no
//!     │                      deferred      skipped (counts as probed)
//!     └─── Commands (TickNow, GetMetrics, Shutdown), TargetChange notifications
//! ```
//!
//! A pass never waits for probes to finish. Each probe runs in its own task
//! holding one permit of the global concurrency semaphore; when the semaphore
//! is exhausted the remaining due targets stay due and are retried on the next
//! pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, trace, warn};

use crate::breaker::CircuitBreaker;
use crate::config::SchedulerConfig;
use crate::orchestrator::MonitoringOrchestrator;
use crate::probe::Prober;
use crate::registry::{TargetChange, TargetRegistry};
use crate::{DeviceId, PingTarget};

use super::messages::{SchedulerCommand, SchedulerMetrics, TickReport};

/// Counters shared between the actor and its probe tasks
#[derive(Debug, Default)]
struct ProbeStats {
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
    completed: AtomicU64,
    completed_window: AtomicU64,
    completed_last_interval: AtomicU64,
    latency_total_us: AtomicU64,
    deferred: AtomicU64,
    breaker_skips: AtomicU64,
}

impl ProbeStats {
    fn record_dispatch(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completion(&self, latency: Duration) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.completed_window.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
    }

    /// Close the current metrics window
    fn roll_window(&self) {
        let completed = self.completed_window.swap(0, Ordering::Relaxed);
        self.completed_last_interval
            .store(completed, Ordering::Relaxed);
    }

    fn average_latency_ms(&self) -> f64 {
        let completed = self.completed.load(Ordering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        self.latency_total_us.load(Ordering::Relaxed) as f64 / completed as f64 / 1000.0
    }
}

/// Actor that owns the probe schedule
///
/// There is one scheduler per engine. It keeps the time of the last probe per
/// monitored target and, on every tick, dispatches the targets whose interval
/// has elapsed.
pub struct SchedulerActor {
    registry: Arc<TargetRegistry>,
    breaker: Arc<CircuitBreaker>,
    prober: Arc<dyn Prober>,
    orchestrator: Arc<MonitoringOrchestrator>,

    /// Global ceiling on in-flight probes
    permits: Arc<Semaphore>,
    max_concurrent: usize,

    tick_interval: Duration,
    metrics_interval: Duration,

    /// When each scheduled target was last dispatched (or skipped by the breaker)
    last_probe: HashMap<DeviceId, Instant>,

    stats: Arc<ProbeStats>,

    command_rx: mpsc::Receiver<SchedulerCommand>,
    change_rx: broadcast::Receiver<TargetChange>,
}

impl SchedulerActor {
    pub fn new(
        config: &SchedulerConfig,
        registry: Arc<TargetRegistry>,
        breaker: Arc<CircuitBreaker>,
        prober: Arc<dyn Prober>,
        orchestrator: Arc<MonitoringOrchestrator>,
        command_rx: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        let change_rx = registry.subscribe();
        Self {
            registry,
            breaker,
            prober,
            orchestrator,
            permits: Arc::new(Semaphore::new(config.max_concurrent_probes)),
            max_concurrent: config.max_concurrent_probes,
            tick_interval: config.tick_interval(),
            metrics_interval: config.metrics_log_interval(),
            last_probe: HashMap::new(),
            stats: Arc::new(ProbeStats::default()),
            command_rx,
            change_rx,
        }
    }

    /// Run the actor's main loop
    ///
    /// This is the entry point for the actor. It runs until:
    /// - A Shutdown command is received
    /// - The command channel is closed
    #[instrument(skip(self), fields(max_concurrent = self.max_concurrent))]
    pub async fn run(mut self) {
        debug!("starting scheduler actor");

        let start = Instant::now();
        let mut ticker = interval_at(start + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut metrics_ticker = interval_at(start + self.metrics_interval, self.metrics_interval);
        metrics_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut changes_open = true;

        loop {
            tokio::select! {
                biased;

                // Registry changes first, so a stopped target is never dispatched again
                change = self.change_rx.recv(), if changes_open => {
                    match change {
                        Ok(change) => self.apply_change(change),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("missed {missed} target changes, resyncing schedule");
                            self.resync();
                        }
                        Err(RecvError::Closed) => {
                            debug!("target change channel closed");
                            changes_open = false;
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::TickNow { respond_to }) => {
                            debug!("received TickNow command");
                            let report = self.tick();
                            let _ = respond_to.send(report);
                        }

                        Some(SchedulerCommand::GetMetrics { respond_to }) => {
                            let _ = respond_to.send(self.metrics());
                        }

                        Some(SchedulerCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }

                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.tick();
                }

                _ = metrics_ticker.tick() => {
                    self.stats.roll_window();
                    self.log_metrics();
                }
            }
        }

        debug!(
            in_flight = self.stats.in_flight.load(Ordering::Relaxed),
            "scheduler actor stopped"
        );
    }

    /// One scheduling pass over the monitored targets
    fn tick(&mut self) -> TickReport {
        let now = Instant::now();
        let snapshot = self.registry.snapshot();
        let mut report = TickReport::default();

        for target in snapshot.values().filter(|target| target.monitored) {
            let due = self
                .last_probe
                .get(&target.device_id)
                .is_none_or(|last| now.saturating_duration_since(*last) >= target.interval());
            if !due {
                continue;
            }
            report.due += 1;

            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                report.deferred += 1;
                continue;
            };

            // a refused target counts as probed for this interval
            self.last_probe.insert(target.device_id.clone(), now);

            if !self.breaker.allow_at(&target.device_id, now) {
                drop(permit);
                report.skipped += 1;
                trace!(device_id = %target.device_id, "probe skipped by circuit breaker");
                continue;
            }

            self.dispatch(target.clone(), permit);
            report.dispatched += 1;
        }

        self.stats
            .deferred
            .fetch_add(report.deferred as u64, Ordering::Relaxed);
        self.stats
            .breaker_skips
            .fetch_add(report.skipped as u64, Ordering::Relaxed);

        if report.due > 0 {
            trace!(
                due = report.due,
                dispatched = report.dispatched,
                deferred = report.deferred,
                skipped = report.skipped,
                "scheduling pass finished"
            );
        }
        if report.deferred > 0 {
            debug!(
                deferred = report.deferred,
                "concurrency ceiling reached, deferring probes to next tick"
            );
        }

        report
    }

    fn dispatch(&self, target: PingTarget, permit: tokio::sync::OwnedSemaphorePermit) {
        let prober = self.prober.clone();
        let registry = self.registry.clone();
        let breaker = self.breaker.clone();
        let orchestrator = self.orchestrator.clone();
        let stats = self.stats.clone();

        stats.record_dispatch();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = prober.probe(&target).await;
            drop(permit);
            stats.record_completion(started.elapsed());

            if !registry.contains_monitored(&target.device_id) {
                trace!(device_id = %target.device_id, "target gone while probing, dropping result");
                return;
            }

            record_breaker_result(&registry, &breaker, &target.device_id, result.success);

            // failures are logged by the orchestrator with device context
            let _ = orchestrator.process_ping_result(result).await;
        });
    }

    fn apply_change(&mut self, change: TargetChange) {
        match change {
            TargetChange::Removed(device_id) | TargetChange::MonitoringStopped(device_id) => {
                if self.last_probe.remove(&device_id).is_some() {
                    debug!(%device_id, "target unscheduled");
                }
            }
            // probe newly monitored targets on the next pass
            TargetChange::MonitoringStarted(device_id) => {
                self.last_probe.remove(&device_id);
            }
            TargetChange::Upserted(_) => {}
        }
    }

    /// Drop schedule entries of targets that are gone or no longer monitored
    fn resync(&mut self) {
        let snapshot = self.registry.snapshot();
        self.last_probe
            .retain(|device_id, _| snapshot.get(device_id).is_some_and(|target| target.monitored));
    }

    fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
            scheduled_targets: self.last_probe.len(),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            completed_last_interval: self.stats.completed_last_interval.load(Ordering::Relaxed),
            average_latency_ms: self.stats.average_latency_ms(),
            deferred: self.stats.deferred.load(Ordering::Relaxed),
            breaker_skips: self.stats.breaker_skips.load(Ordering::Relaxed),
        }
    }

    fn log_metrics(&self) {
        let metrics = self.metrics();
        let breaker = self.breaker.metrics();
        info!(
            in_flight = metrics.in_flight,
            scheduled = metrics.scheduled_targets,
            completed = metrics.completed_last_interval,
            avg_latency_ms = format!("{:.2}", metrics.average_latency_ms),
            deferred = metrics.deferred,
            breaker_open = breaker.open,
            breaker_half_open = breaker.half_open,
            breaker_skips = breaker.skipped_probes,
            "scheduler metrics"
        );
    }
}

/// Handle for controlling the SchedulerActor
///
/// The handle can be cloned and shared across tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the scheduler actor and return a handle to it
    pub fn spawn(
        config: &SchedulerConfig,
        registry: Arc<TargetRegistry>,
        breaker: Arc<CircuitBreaker>,
        prober: Arc<dyn Prober>,
        orchestrator: Arc<MonitoringOrchestrator>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = SchedulerActor::new(config, registry, breaker, prober, orchestrator, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a scheduling pass immediately
    pub async fn tick_now(&self) -> Result<TickReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TickNow { respond_to: tx })
            .await
            .context("failed to send TickNow command")?;

        rx.await.context("failed to receive tick report")
    }

    pub async fn get_metrics(&self) -> Result<SchedulerMetrics> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::GetMetrics { respond_to: tx })
            .await
            .context("failed to send GetMetrics command")?;

        rx.await.context("failed to receive scheduler metrics")
    }

    /// Gracefully shut down the scheduler
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

/// Feed a probe outcome to the breaker
///
/// A stop or removal landing between the monitored check and this call has
/// already forgotten the device, so the circuit recreated here is dropped again.
fn record_breaker_result(
    registry: &TargetRegistry,
    breaker: &CircuitBreaker,
    device_id: &DeviceId,
    success: bool,
) {
    breaker.record_result(device_id, success);
    if !registry.contains_monitored(device_id) {
        breaker.forget(device_id);
    }
}
