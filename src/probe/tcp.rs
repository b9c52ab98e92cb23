//! TCP probe: dial, optionally over TLS, optionally exchange a
//! send/expect/quit sequence.

use std::time::{Duration, Instant};

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{new_metric, tls, ProbeError, ProbeResult};
use crate::client::Host;
use crate::config::duration_opt;
use crate::metric::Metric;
use crate::template;

const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TCP_MAX_BYTES: usize = 32 * 1024;
const DEFAULT_TCP_PREFIX: &str = "tcp";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpProbeConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub send: String,
    #[serde(default)]
    pub quit: String,
    #[serde(default)]
    pub max_bytes: Option<usize>,
    #[serde(default)]
    pub expect_pattern: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub no_check_certificate: bool,
    #[serde(default)]
    pub metric_key_prefix: Option<String>,
}

impl TcpProbeConfig {
    pub fn generate_probe(&self, host: &Host) -> Result<TcpProbe, ProbeError> {
        let value = host.template_value();
        let expect_pattern = template::expand(&self.expect_pattern, Some(&value), None)?;
        let expect = if expect_pattern.is_empty() {
            None
        } else {
            Some(
                Regex::new(&expect_pattern)
                    .map_err(|e| ProbeError::Config(format!("invalid expect_pattern: {e}")))?,
            )
        };
        Ok(TcpProbe {
            host: template::expand(&self.host, Some(&value), None)?,
            port: template::expand(&self.port, Some(&value), None)?,
            send: template::expand(&self.send, Some(&value), None)?,
            quit: self.quit.clone(),
            max_bytes: self.max_bytes.unwrap_or(DEFAULT_TCP_MAX_BYTES),
            expect,
            timeout: self.timeout.unwrap_or(DEFAULT_TCP_TIMEOUT),
            tls: self.tls,
            no_check_certificate: self.no_check_certificate,
            prefix: self
                .metric_key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_TCP_PREFIX.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub host: String,
    pub port: String,
    pub send: String,
    pub quit: String,
    pub max_bytes: usize,
    pub expect: Option<Regex>,
    pub timeout: Duration,
    pub tls: bool,
    pub no_check_certificate: bool,
    prefix: String,
}

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

impl TcpProbe {
    fn metric(&self, suffix: &str, value: f64) -> Metric {
        new_metric(&self.prefix, suffix, value)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> ProbeResult {
        let start = Instant::now();
        let mut ms = Vec::new();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::Canceled),
            attempted = tokio::time::timeout(self.timeout, self.attempt(&mut ms)) => {
                match attempted {
                    Ok(r) => r,
                    Err(_) => Err(ProbeError::Timeout(self.timeout)),
                }
            }
        };

        ms.push(self.metric("elapsed.seconds", start.elapsed().as_secs_f64()));
        ms.push(self.metric("check.ok", if outcome.is_ok() { 1.0 } else { 0.0 }));
        debug!(ok = outcome.is_ok(), "tcp probe completed");
        ProbeResult {
            metrics: ms,
            error: outcome.err(),
        }
    }

    async fn attempt(&self, ms: &mut Vec<Metric>) -> Result<(), ProbeError> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!(%addr, "dialing");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let mut conn: Box<dyn Conn> = if self.tls {
            let stream = tls::handshake(tcp, &self.host, self.no_check_certificate).await?;
            if let Some(cert) = stream.ssl().peer_certificate() {
                let days = tls::expires_in_days(&cert)?;
                ms.push(self.metric("certificate.expires_in_days", days));
            }
            Box::new(stream)
        } else {
            Box::new(tcp)
        };
        debug!(%addr, "connected");

        if !self.send.is_empty() {
            debug!(data = %self.send, "send");
            conn.write_all(self.send.as_bytes())
                .await
                .map_err(|e| ProbeError::Send(e.to_string()))?;
        }
        if let Some(pattern) = &self.expect {
            let mut buf = vec![0u8; self.max_bytes];
            let n = conn
                .read(&mut buf)
                .await
                .map_err(|e| ProbeError::Read(e.to_string()))?;
            debug!(data = %String::from_utf8_lossy(&buf[..n]), "read");
            if !pattern.is_match(&buf[..n]) {
                return Err(ProbeError::UnexpectedResponse);
            }
        }
        if !self.quit.is_empty() {
            debug!(data = %self.quit, "quit");
            let _ = conn.write_all(self.quit.as_bytes()).await;
        }
        Ok(())
    }
}
