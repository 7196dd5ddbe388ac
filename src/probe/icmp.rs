//! ICMP echo prober with `ping` command fallback
//!
//! Native probing opens a raw ICMP socket when privileged and an unprivileged
//! datagram ICMP socket otherwise, sets it non-blocking and hands it to the
//! Tokio reactor. When neither socket type can be created, the system `ping`
//! binary is spawned instead.

use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{LazyLock, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{ProbeError, Prober, probe_with_timeout};
use crate::{PingResult, PingTarget};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// 8 byte header plus 56 bytes of payload, same as `ping`
const ECHO_PACKET_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        info!("icmp prober: using raw ICMP sockets");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        info!("icmp prober: using unprivileged datagram ICMP sockets");
        return IcmpCapability::Native;
    }

    info!("icmp prober: native ICMP unavailable, falling back to the ping command");
    IcmpCapability::CommandOnly
}

/// Identifier and sequence number for one echo request
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

#[derive(Debug, Clone)]
pub struct IcmpProber {
    timeout: Duration,
}

impl IcmpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn ping(&self, address: &str) -> Result<Duration, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
        if capability == IcmpCapability::CommandOnly {
            return run_ping_command(address, self.timeout).await;
        }

        let ip = resolve_address(address).await?;
        match echo(ip).await {
            Err(ProbeError::PermissionDenied(reason)) => {
                warn!("native ICMP to {address} not permitted ({reason}), using ping command");
                run_ping_command(address, self.timeout).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, target: &PingTarget) -> PingResult {
        let address = target.probe_address();
        probe_with_timeout(target, self.timeout, self.ping(&address)).await
    }
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeError::Resolve(format!("{address}: {e}")))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ProbeError::Resolve(address.to_string()))
}

fn io_error(context: &str, err: std::io::Error) -> ProbeError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        ProbeError::PermissionDenied(format!("{context}: {err}"))
    } else {
        ProbeError::Network(format!("{context}: {err}"))
    }
}

/// Open a connected, non-blocking ICMP socket registered with the reactor
///
/// Returns whether the socket is raw; raw IPv4 sockets deliver the IP header
/// in front of the ICMP message and keep our echo identifier intact.
fn open_socket(ip: IpAddr) -> Result<(UdpSocket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, true),
        Err(_) => (
            Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|e| io_error("failed to create ICMP socket", e))?,
            false,
        ),
    };

    socket
        .set_nonblocking(true)
        .map_err(|e| io_error("failed to set non-blocking", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| io_error("failed to connect", e))?;

    let socket = UdpSocket::from_std(socket.into())
        .map_err(|e| io_error("failed to register ICMP socket", e))?;
    Ok((socket, raw))
}

/// Send one echo request and wait for the matching reply
///
/// The caller bounds this with the probe timeout.
async fn echo(ip: IpAddr) -> Result<Duration, ProbeError> {
    let (socket, raw) = open_socket(ip)?;
    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(ip.is_ipv4(), identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .await
        .map_err(|e| io_error("failed to send echo request", e))?;

    let mut buf = [0u8; 1500];
    loop {
        let len = socket
            .recv(&mut buf)
            .await
            .map_err(|e| io_error("failed to receive echo reply", e))?;

        if is_matching_reply(&buf[..len], ip.is_ipv4(), raw, identifier, sequence) {
            return Ok(start.elapsed());
        }
    }
}

/// Build an echo request; IPv4 carries its RFC 1071 checksum, the kernel
/// fills in the ICMPv6 one
fn build_echo_request(ipv4: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ECHO_PACKET_LEN];
    packet[0] = if ipv4 { ICMP_ECHO_REQUEST } else { ICMPV6_ECHO_REQUEST };
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let sent_at = chrono::Utc::now().timestamp_micros();
    packet[8..16].copy_from_slice(&sent_at.to_be_bytes());

    if ipv4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

fn is_matching_reply(packet: &[u8], ipv4: bool, raw: bool, identifier: u16, sequence: u16) -> bool {
    let offset = if ipv4 && raw && packet.first().is_some_and(|b| b >> 4 == 4) {
        usize::from(packet[0] & 0x0f) * 4
    } else {
        0
    };

    let Some(header) = packet.get(offset..offset + 8) else {
        return false;
    };

    let expected_type = if ipv4 { ICMP_ECHO_REPLY } else { ICMPV6_ECHO_REPLY };
    let reply_id = u16::from_be_bytes([header[4], header[5]]);
    let reply_seq = u16::from_be_bytes([header[6], header[7]]);

    // datagram sockets rewrite the identifier to the local port
    header[0] == expected_type && reply_seq == sequence && (!raw || reply_id == identifier)
}

/// Internet checksum (RFC 1071)
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        if stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Command(stderr.trim().to_string()));
    }

    parse_ping_output(&stdout)
}

static REPLY_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").ok());

static ROUND_TRIP_SUMMARY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/")
        .ok()
});

/// Extract the round-trip time from `ping` output
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    [&REPLY_TIME, &ROUND_TRIP_SUMMARY]
        .into_iter()
        .filter_map(|re| LazyLock::force(re).as_ref())
        .find_map(|re| re.captures(output))
        .and_then(|caps| caps.name("ms")?.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command("could not parse ping output".to_string()))
}

// ============================================================================
// Tests
// ============================================================================
