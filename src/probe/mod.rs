//! Reachability probes
//!
//! A [`Prober`] turns one [`PingTarget`] into one [`PingResult`]. Probing never
//! fails from the caller's point of view: timeouts, resolution errors and
//! refused sockets all come back as a failed result carrying the error message.
//!
//! Implementations suspend only on socket I/O driven by the Tokio reactor, so
//! thousands of in-flight probes cost thousands of tasks, not threads.

pub mod icmp;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::trace;

use crate::config::{ProbeConfig, ProbeMethod};
use crate::{PingResult, PingTarget};

pub use icmp::IcmpProber;
pub use tcp::TcpProber;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("ping command failed: {0}")]
    Command(String),
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe the target once, bounded by the prober's timeout
    async fn probe(&self, target: &PingTarget) -> PingResult;
}

/// Build the prober selected by configuration
pub fn build_prober(config: &ProbeConfig) -> Arc<dyn Prober> {
    match config.method {
        ProbeMethod::Icmp => Arc::new(IcmpProber::new(config.timeout())),
        ProbeMethod::Tcp => Arc::new(TcpProber::new(config.tcp_port, config.timeout())),
    }
}

/// Run `check` against the target's probe address under a hard timeout and
/// fold the outcome into a [`PingResult`]
pub(crate) async fn probe_with_timeout<F>(
    target: &PingTarget,
    timeout: Duration,
    check: F,
) -> PingResult
where
    F: Future<Output = Result<Duration, ProbeError>>,
{
    let address = target.probe_address();
    let timestamp = Utc::now();

    let outcome = match tokio::time::timeout(timeout, check).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    };

    match outcome {
        Ok(rtt) => {
            let rtt_ms = rtt.as_secs_f64() * 1000.0;
            trace!(device_id = %target.device_id, %address, rtt_ms, "probe succeeded");
            PingResult::success(target.device_id.clone(), address, rtt_ms, timestamp)
        }
        Err(e) => {
            trace!(device_id = %target.device_id, %address, "probe failed: {e}");
            PingResult::failure(target.device_id.clone(), address, e.to_string(), timestamp)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
