//! Message types for actor communication
//!
//! Commands are sent to a specific actor over its mpsc channel; queries carry a
//! oneshot sender for the reply.

use serde::Serialize;
use tokio::sync::oneshot;

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run one scheduling pass immediately (bypassing the tick timer)
    ///
    /// Used for testing and manual refresh operations.
    TickNow {
        respond_to: oneshot::Sender<TickReport>,
    },

    /// Snapshot the scheduler's throughput counters
    GetMetrics {
        respond_to: oneshot::Sender<SchedulerMetrics>,
    },

    /// Gracefully shut down the scheduler
    ///
    /// Probes already in flight run to completion; no new ones are dispatched.
    Shutdown,
}

/// What a single scheduling pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Monitored targets whose interval had elapsed
    pub due: usize,

    /// Probes spawned during this pass
    pub dispatched: usize,

    /// Due targets left for the next pass because the concurrency ceiling was reached
    pub deferred: usize,

    /// Due targets the circuit breaker refused
    pub skipped: usize,
}

/// Scheduler throughput counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerMetrics {
    /// Probes currently running
    pub in_flight: usize,

    /// Concurrency ceiling
    pub max_concurrent: usize,

    /// Targets with a schedule entry
    pub scheduled_targets: usize,

    /// Probes dispatched since start
    pub dispatched: u64,

    /// Probes completed since start
    pub completed: u64,

    /// Probes completed during the last metrics interval
    pub completed_last_interval: u64,

    /// Mean probe latency over all completed probes
    pub average_latency_ms: f64,

    /// Dispatch attempts deferred for lack of a permit, since start
    pub deferred: u64,

    /// Probes skipped by the circuit breaker, since start
    pub breaker_skips: u64,
}
