//! HTTP probe: one request per run, reporting status, body length,
//! response time and certificate expiry for HTTPS targets.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{new_metric, tls, ProbeError, ProbeResult};
use crate::client::Host;
use crate::config::duration_opt;
use crate::metric::Metric;
use crate::template;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_HTTP_PREFIX: &str = "http";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpProbeConfig {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub expect_pattern: String,
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub no_check_certificate: bool,
    #[serde(default)]
    pub metric_key_prefix: Option<String>,
}

impl HttpProbeConfig {
    pub fn generate_probe(&self, host: &Host) -> Result<HttpProbe, ProbeError> {
        let value = host.template_value();
        let url = template::expand(&self.url, Some(&value), None)?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProbeError::Config(format!("invalid URL {url}")));
        }
        let mut headers = HashMap::with_capacity(self.headers.len());
        for (name, raw) in &self.headers {
            headers.insert(name.clone(), template::expand(raw, Some(&value), None)?);
        }
        let expect_pattern = template::expand(&self.expect_pattern, Some(&value), None)?;
        let expect = if expect_pattern.is_empty() {
            None
        } else {
            Some(
                Regex::new(&expect_pattern)
                    .map_err(|e| ProbeError::Config(format!("invalid expect_pattern: {e}")))?,
            )
        };
        Ok(HttpProbe {
            url,
            method: self
                .method
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "GET".to_string()),
            headers,
            body: template::expand(&self.body, Some(&value), None)?,
            expect,
            timeout: self.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT),
            no_check_certificate: self.no_check_certificate,
            prefix: self
                .metric_key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_HTTP_PREFIX.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub expect: Option<Regex>,
    pub timeout: Duration,
    pub no_check_certificate: bool,
    prefix: String,
}

impl HttpProbe {
    fn metric(&self, suffix: &str, value: f64) -> Metric {
        new_metric(&self.prefix, suffix, value)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> ProbeResult {
        let start = Instant::now();
        let mut ms = Vec::new();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::Canceled),
            attempted = self.attempt(&mut ms) => attempted,
        };

        ms.push(self.metric("response_time.seconds", start.elapsed().as_secs_f64()));
        ms.push(self.metric("check.ok", if outcome.is_ok() { 1.0 } else { 0.0 }));
        ProbeResult {
            metrics: ms,
            error: outcome.err(),
        }
    }

    async fn attempt(&self, ms: &mut Vec<Metric>) -> Result<(), ProbeError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.no_check_certificate)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        let method = reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|e| ProbeError::Config(format!("invalid method: {e}")))?;
        let mut req = client
            .request(method, &self.url)
            // health checks must not keep the connection alive
            .header(reqwest::header::CONNECTION, "close")
            .body(self.body.clone());
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }

        debug!(method = %self.method, url = %self.url, "http request");
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Connect(e.to_string())
            }
        })?;

        let status = resp.status();
        ms.push(self.metric("status.code", status.as_u16() as f64));

        if self.url.starts_with("https://") {
            self.report_certificate_expiry(ms).await;
        }

        let body = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Read(e.to_string())
            }
        })?;
        ms.push(self.metric("content.length", body.len() as f64));

        if let Some(pattern) = &self.expect {
            if !pattern.is_match(&body) {
                return Err(ProbeError::UnexpectedResponse);
            }
        }
        if status.as_u16() >= 400 {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(())
    }

    /// The HTTP client does not expose the peer certificate, so expiry
    /// comes from a dedicated handshake. A failure here never fails
    /// the probe; the request above already succeeded.
    async fn report_certificate_expiry(&self, ms: &mut Vec<Metric>) {
        let parsed = match reqwest::Url::parse(&self.url) {
            Ok(u) => u,
            Err(_) => return,
        };
        let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default()) else {
            return;
        };
        match tls::certificate_expires_in_days(host, port, self.no_check_certificate).await {
            Ok(days) => ms.push(self.metric("certificate.expires_in_days", days)),
            Err(err) => warn!(%err, url = %self.url, "failed to inspect server certificate"),
        }
    }
}
