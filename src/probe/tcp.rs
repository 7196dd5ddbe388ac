//! TCP connect prober
//!
//! Useful where ICMP is filtered. A refused connection still proves the host
//! is up and answering, so it counts as reachable.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{ProbeError, Prober, probe_with_timeout};
use crate::{PingResult, PingTarget};

#[derive(Debug, Clone)]
pub struct TcpProber {
    port: u16,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    async fn connect(&self, address: &str) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        match TcpStream::connect((address, self.port)).await {
            Ok(_) => Ok(start.elapsed()),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(start.elapsed()),
            Err(e) => Err(ProbeError::Network(format!(
                "connect to {address}:{} failed: {e}",
                self.port
            ))),
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &PingTarget) -> PingResult {
        let address = target.probe_address();
        probe_with_timeout(target, self.timeout, self.connect(&address)).await
    }
}

// ============================================================================
// Tests
// ============================================================================
