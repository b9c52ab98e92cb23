//! Probe leaves: ICMP, TCP, HTTP, gRPC health and plugin command.
//!
//! Each leaf is generated per-target per-tick from its configuration
//! (template placeholders expanded against the host), runs one check,
//! and returns the samples it gathered together with an optional
//! error. Every leaf emits `check.ok` and an elapsed-time sample even
//! when the check fails.

mod command;
mod grpc;
mod http;
mod ping;
mod tcp;
mod tls;

pub use command::{CommandProbe, CommandProbeConfig};
pub use grpc::{GrpcProbe, GrpcProbeConfig};
pub use http::{HttpProbe, HttpProbeConfig};
pub use ping::{PingProbe, PingProbeConfig};
pub use tcp::{TcpProbe, TcpProbeConfig};

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::metric::Metric;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0}")]
    Expand(#[from] crate::template::TemplateError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("resolve failed: {0}")]
    Resolve(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("health check failed: {code:?}")]
    Health { code: tonic::Code },
    #[error("service not healthy: {0}")]
    NotServing(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("canceled")]
    Canceled,
}

/// Samples gathered by one probe run, plus the failure if the check
/// did not pass. Metrics are present either way.
pub struct ProbeResult {
    pub metrics: Vec<Metric>,
    pub error: Option<ProbeError>,
}

/// One generated probe, ready to run once against its target.
pub enum Probe {
    Ping(PingProbe),
    Tcp(TcpProbe),
    Http(HttpProbe),
    Grpc(GrpcProbe),
    Command(CommandProbe),
}

impl Probe {
    pub async fn run(&self, cancel: &CancellationToken) -> ProbeResult {
        match self {
            Probe::Ping(p) => p.run(cancel).await,
            Probe::Tcp(p) => p.run(cancel).await,
            Probe::Http(p) => p.run(cancel).await,
            Probe::Grpc(p) => p.run(cancel).await,
            // the command probe deliberately outlives the caller's
            // cancellation so a plugin is never killed mid-output
            Probe::Command(p) => p.run().await,
        }
    }

    pub fn probe_type(&self) -> &'static str {
        match self {
            Probe::Ping(_) => "ping",
            Probe::Tcp(_) => "tcp",
            Probe::Http(_) => "http",
            Probe::Grpc(_) => "grpc",
            Probe::Command(_) => "command",
        }
    }
}

/// Build a sample named `<prefix>.<suffix>` stamped with the current
/// time. An empty prefix yields the bare suffix (command probes).
pub(crate) fn new_metric(prefix: &str, suffix: &str, value: f64) -> Metric {
    if prefix.is_empty() {
        Metric::new(suffix, value)
    } else {
        Metric::new(format!("{prefix}.{suffix}"), value)
    }
}
