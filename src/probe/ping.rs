//! ICMP echo probe.
//!
//! Issues `count` echo rounds against the resolved address and reports
//! success/failure counts plus RTT statistics. Raw ICMP sockets are
//! tried first, falling back to unprivileged DGRAM sockets. The
//! blocking socket work runs on the blocking pool so RTT timing is not
//! skewed by the async scheduler.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{new_metric, ProbeError, ProbeResult};
use crate::client::Host;
use crate::config::duration_opt;
use crate::template;

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_PING_COUNT: u32 = 3;
const DEFAULT_PING_PREFIX: &str = "ping";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingProbeConfig {
    pub address: String,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metric_key_prefix: Option<String>,
}

impl PingProbeConfig {
    pub fn generate_probe(&self, host: &Host) -> Result<PingProbe, ProbeError> {
        let address = template::expand(&self.address, Some(&host.template_value()), None)?;
        Ok(PingProbe {
            address,
            count: self.count.unwrap_or(DEFAULT_PING_COUNT).max(1),
            timeout: self.timeout.unwrap_or(DEFAULT_PING_TIMEOUT),
            prefix: self
                .metric_key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_PING_PREFIX.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PingProbe {
    pub address: String,
    pub count: u32,
    pub timeout: Duration,
    prefix: String,
}

impl PingProbe {
    fn metric(&self, suffix: &str, value: f64) -> crate::metric::Metric {
        new_metric(&self.prefix, suffix, value)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> ProbeResult {
        let start = Instant::now();
        let mut ms = Vec::new();

        debug!(address = %self.address, "run ping");
        let ip = match resolve(&self.address).await {
            Ok(ip) => ip,
            Err(err) => {
                ms.push(self.metric("count.success", 0.0));
                ms.push(self.metric("count.failure", 1.0));
                ms.push(self.metric("check.ok", 0.0));
                ms.push(self.metric("elapsed.seconds", start.elapsed().as_secs_f64()));
                return ProbeResult {
                    metrics: ms,
                    error: Some(err),
                };
            }
        };
        debug!(address = %self.address, %ip, "resolved");

        let identifier: u16 = rand::random();
        let mut rtts: Vec<Duration> = Vec::with_capacity(self.count as usize);
        let mut failures = 0u32;
        for seq in 0..self.count {
            if cancel.is_cancelled() {
                break;
            }
            let timeout = self.timeout;
            let joined =
                tokio::task::spawn_blocking(move || ping_once(ip, identifier, seq as u16, timeout))
                    .await;
            match joined {
                Ok(Ok(rtt)) => {
                    debug!(?rtt, "echo reply");
                    rtts.push(rtt);
                }
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(address = %self.address, %ip, %err, "ping failed");
                }
                Err(err) => {
                    failures += 1;
                    warn!(%err, "ping task failed");
                }
            }
        }

        ms.push(self.metric("count.success", rtts.len() as f64));
        ms.push(self.metric("count.failure", failures as f64));
        if !rtts.is_empty() {
            let min = rtts.iter().min().unwrap().as_secs_f64();
            let max = rtts.iter().max().unwrap().as_secs_f64();
            let avg = rtts.iter().map(Duration::as_secs_f64).sum::<f64>() / rtts.len() as f64;
            ms.push(self.metric("rtt.min", min));
            ms.push(self.metric("rtt.max", max));
            ms.push(self.metric("rtt.avg", avg));
        }
        ms.push(self.metric("check.ok", if rtts.is_empty() { 0.0 } else { 1.0 }));
        ms.push(self.metric("elapsed.seconds", start.elapsed().as_secs_f64()));

        ProbeResult {
            metrics: ms,
            error: None,
        }
    }
}

async fn resolve(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeError::Resolve(e.to_string()))?;
    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolve(format!("no addresses found for {address}")))
}

/// One echo round: send a request and wait for the matching reply,
/// bounded by `max_rtt`.
fn ping_once(ip: IpAddr, identifier: u16, sequence: u16, max_rtt: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, echo_request, echo_reply) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where enabled
    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Connect(format!("failed to create ICMP socket: {e}")))?;
    socket
        .set_read_timeout(Some(max_rtt))
        .and_then(|_| socket.set_write_timeout(Some(max_rtt)))
        .map_err(|e| ProbeError::Connect(e.to_string()))?;
    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Connect(e.to_string()))?;

    let packet = build_echo_request(echo_request, ip.is_ipv4(), identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Send(e.to_string()))?;

    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                ProbeError::Timeout(max_rtt)
            } else {
                ProbeError::Read(e.to_string())
            }
        })?;
        let elapsed = start.elapsed();
        if elapsed >= max_rtt {
            return Err(ProbeError::Timeout(max_rtt));
        }
        // SAFETY: recv initialized the first `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };

        // RAW v4 sockets deliver the IP header; DGRAM delivers bare ICMP
        let offset = if ip.is_ipv4() && len >= 20 && buf[0] >> 4 == 4 {
            20
        } else {
            0
        };
        if len >= offset + 8 {
            let reply_type = buf[offset];
            let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
            let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);
            if reply_type == echo_reply && reply_id == identifier && reply_seq == sequence {
                return Ok(elapsed);
            }
        }
        // not our reply, keep waiting for the right one
    }
}

/// 8-byte echo header plus a 56-byte payload. The checksum is filled
/// for IPv4; the kernel computes it for ICMPv6.
fn build_echo_request(echo_type: u8, is_v4: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = echo_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    if is_v4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [odd] = chunks.remainder() {
        sum += (*odd as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}
