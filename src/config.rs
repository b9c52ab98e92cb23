//! Agent configuration: YAML model, source fetching and reload digest.
//!
//! The configuration source is a local path, an `http(s)://` URL or an
//! `s3://bucket/key` object. The raw bytes are hashed with SHA-256; the
//! run loop reloads only when the digest changes.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::de::{Deserializer, Error as DeError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::calc::{self, CalcFn};
use crate::client::Host;
use crate::probe::{
    CommandProbeConfig, GrpcProbeConfig, HttpProbeConfig, PingProbeConfig, Probe, TcpProbeConfig,
};
use crate::template;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("load config failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("load config failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("load config failed: {0}")]
    S3(String),
    #[error("yaml parse failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config initialize failed: {0}")]
    Invalid(String),
}

/// A configuration string with placeholders expanded at parse time
/// (no host is in scope yet, so only `env`/`must_env` apply).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExString(pub String);

impl ExString {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ExString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ExString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl<'de> Deserialize<'de> for ExString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let expanded = template::expand(&raw, None, None).map_err(D::Error::custom)?;
        Ok(Self(expanded))
    }
}

pub fn ex_strings(es: &[ExString]) -> Vec<String> {
    es.iter().map(|s| s.0.clone()).collect()
}

/// Serde adapter for optional duration fields accepting either
/// suffixed literals (`5s`, `3m`) or plain seconds.
pub mod duration_opt {
    use super::*;
    use serde::de::Unexpected;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<Raw>::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(Raw::Text(s)) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(|_| D::Error::invalid_value(Unexpected::Str(&s), &"a duration like 5s")),
            Some(Raw::Seconds(secs)) if secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            Some(Raw::Seconds(secs)) => Err(D::Error::invalid_value(
                Unexpected::Float(secs),
                &"a non-negative duration",
            )),
        }
    }

    pub fn serialize<S: serde::Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub location: String,

    #[serde(default)]
    pub probes: Vec<ProbeDefinition>,
    #[serde(default = "default_true")]
    pub post_probed_metrics: bool,

    #[serde(default)]
    pub aggregates: Vec<AggregateDefinition>,
    #[serde(default = "default_true")]
    pub post_aggregated_metrics: bool,

    /// Deprecated; mapped to `!post_probed_metrics` with a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_only: Option<bool>,

    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub firehose_stream_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub mackerel: MackerelConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MackerelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MackerelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
    #[serde(default)]
    pub stats_attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeDefinition {
    #[serde(default)]
    pub service: ExString,
    #[serde(default)]
    pub role: ExString,
    #[serde(default)]
    pub roles: Vec<ExString>,
    #[serde(default)]
    pub statuses: Vec<ExString>,

    #[serde(default, rename = "service_metric")]
    pub is_service_metric: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandProbeConfig>,

    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl ProbeDefinition {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.is_service_metric
            && (!self.role.is_empty() || !self.roles.is_empty() || !self.statuses.is_empty())
        {
            return Err(ConfigError::Invalid(
                "probe for service metric cannot have role or roles or statuses".to_string(),
            ));
        }
        Ok(())
    }

    /// Build one probe per configured kind for the given host. A kind
    /// whose generation fails (usually template expansion) is logged
    /// and skipped; the remaining kinds still run.
    pub fn generate_probes(&self, host: &Host) -> Vec<Probe> {
        let mut probes = Vec::new();
        if let Some(pc) = &self.ping {
            match pc.generate_probe(host) {
                Ok(p) => probes.push(Probe::Ping(p)),
                Err(err) => error!(
                    host_id = %host.id, host = %host.name, %err,
                    "cannot generate ping probe"
                ),
            }
        }
        if let Some(pc) = &self.tcp {
            match pc.generate_probe(host) {
                Ok(p) => probes.push(Probe::Tcp(p)),
                Err(err) => error!(
                    host_id = %host.id, host = %host.name, %err,
                    "cannot generate tcp probe"
                ),
            }
        }
        if let Some(pc) = &self.http {
            match pc.generate_probe(host) {
                Ok(p) => probes.push(Probe::Http(p)),
                Err(err) => error!(
                    host_id = %host.id, host = %host.name, %err,
                    "cannot generate http probe"
                ),
            }
        }
        if let Some(pc) = &self.grpc {
            match pc.generate_probe(host) {
                Ok(p) => probes.push(Probe::Grpc(p)),
                Err(err) => error!(
                    host_id = %host.id, host = %host.name, %err,
                    "cannot generate grpc probe"
                ),
            }
        }
        if let Some(pc) = &self.command {
            match pc.generate_probe(host) {
                Ok(p) => probes.push(Probe::Command(p)),
                Err(err) => error!(
                    host_id = %host.id, host = %host.name, %err,
                    "cannot generate command probe"
                ),
            }
        }
        probes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateDefinition {
    pub service: ExString,
    #[serde(default)]
    pub role: ExString,
    #[serde(default)]
    pub roles: Vec<ExString>,
    #[serde(default)]
    pub statuses: Vec<ExString>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: ExString,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub func: ExString,
    pub name: ExString,
    #[serde(default)]
    pub emit_zero: bool,

    #[serde(skip)]
    pub calc: Option<CalcFn>,
}

impl Config {
    /// Load and validate configuration from `location`, returning the
    /// config together with the hex SHA-256 digest of the raw bytes.
    pub async fn load(location: &str) -> Result<(Self, String), ConfigError> {
        let bytes = fetch(location).await?;
        let mut conf: Config = serde_yaml::from_slice(&bytes)?;
        conf.location = location.to_string();
        conf.initialize()?;
        let digest = format!("{:x}", Sha256::digest(&bytes));
        Ok((conf, digest))
    }

    fn initialize(&mut self) -> Result<(), ConfigError> {
        for pd in &mut self.probes {
            if !pd.role.is_empty() {
                pd.roles.push(pd.role.clone());
            }
            if let Some(command) = &mut pd.command {
                command
                    .initialize()
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            }
            pd.validate()?;
        }
        for ad in &mut self.aggregates {
            if !ad.role.is_empty() {
                ad.roles.push(ad.role.clone());
            }
        }

        if let Some(probe_only) = self.probe_only {
            warn!("configuration probe_only is deprecated. use post_probed_metrics");
            self.post_probed_metrics = !probe_only;
        }

        for ag in &mut self.aggregates {
            for mc in &mut ag.metrics {
                for oc in &mut mc.outputs {
                    oc.calc = calc::lookup(oc.func.as_str());
                    if oc.calc.is_none() {
                        warn!(
                            func = %oc.func, output = %mc.name,
                            "func is not available for outputs"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

async fn fetch(location: &str) -> Result<Vec<u8>, ConfigError> {
    match reqwest::Url::parse(location) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => fetch_http(url).await,
        Ok(url) if url.scheme() == "s3" => fetch_s3(url).await,
        Ok(url) if url.scheme() == "file" => Ok(tokio::fs::read(url.path()).await?),
        _ => Ok(tokio::fs::read(location).await?),
    }
}

async fn fetch_http(url: reqwest::Url) -> Result<Vec<u8>, ConfigError> {
    debug!(%url, "fetching config over HTTP");
    let resp = reqwest::get(url).await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}

async fn fetch_s3(url: reqwest::Url) -> Result<Vec<u8>, ConfigError> {
    debug!(%url, "fetching config from S3");
    let bucket = url
        .host_str()
        .ok_or_else(|| ConfigError::S3("missing bucket".to_string()))?
        .to_string();
    let key = url.path().trim_start_matches('/').to_string();
    let aws = aws_config::load_from_env().await;
    let svc = aws_sdk_s3::Client::new(&aws);
    let out = svc
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| ConfigError::S3(format!("failed to get from S3, {e}")))?;
    let data = out
        .body
        .collect()
        .await
        .map_err(|e| ConfigError::S3(format!("failed to download from S3, {e}")))?;
    Ok(data.into_bytes().to_vec())
}
