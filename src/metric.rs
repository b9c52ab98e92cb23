//! Metric samples and their wire representations.
//!
//! A [`Metric`] is a plain named sample. [`HostMetric`] and
//! [`ServiceMetric`] bind one to a Mackerel host or service;
//! [`MetricValue`] / [`HostMetricValue`] are the JSON shapes accepted
//! by the Mackerel time-series API (and written to the spill stream).

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

/// Attributes carried by every sample: the originating service and
/// host plus free-form extras from the probe definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribute {
    pub service: String,
    pub host_id: String,
    pub extra: BTreeMap<String, String>,
}

impl Attribute {
    /// Expand and attach the probe definition's attribute mapping.
    /// Values that fail to expand are logged and dropped; the other
    /// attributes survive.
    pub fn set_extra(&mut self, extra: &std::collections::HashMap<String, String>, host: Option<&Value>) {
        for (k, v) in extra {
            match crate::template::expand(v, host, None) {
                Ok(expanded) => {
                    self.extra.insert(k.clone(), expanded);
                }
                Err(err) => {
                    error!(value = %v, %err, "cannot expand attribute placeholder");
                }
            }
        }
    }

    pub fn otel_key_values(&self) -> Vec<KeyValue> {
        let mut kvs: Vec<KeyValue> = self
            .extra
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect();
        kvs.push(KeyValue::new("service.name", self.service.clone()));
        kvs.push(KeyValue::new("host.id", self.host_id.clone()));
        kvs
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self
            .extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain([("service.name", self.service.as_str()), ("host.id", self.host_id.as_str())])
        {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v:?}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub attribute: Attribute,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: Utc::now(),
            attribute: Attribute::default(),
        }
    }

    pub fn host_metric(self, host_id: impl Into<String>) -> HostMetric {
        HostMetric {
            host_id: host_id.into(),
            metric: self,
        }
    }

    pub fn service_metric(self, service: impl Into<String>) -> ServiceMetric {
        ServiceMetric {
            service: service.into(),
            metric: self,
        }
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.timestamp.timestamp().max(0) as u64)
    }

    /// One gauge with a single data point, as exported over OTLP.
    pub fn otel_data(&self) -> data::Metric {
        data::Metric {
            name: self.name.clone().into(),
            description: "".into(),
            unit: "".into(),
            data: Box::new(data::Gauge {
                data_points: vec![data::DataPoint {
                    attributes: self.attribute.otel_key_values(),
                    start_time: None,
                    time: Some(self.system_time()),
                    value: self.value,
                    exemplars: vec![],
                }],
            }),
        }
    }

    /// Prometheus-exposition-like one-liner for dump mode.
    pub fn otel_string(&self) -> String {
        format!("{}{{{}}} {:.6}", self.name, self.attribute, self.value)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{:.6}\t{}", self.name, self.value, self.timestamp.timestamp())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostMetric {
    pub host_id: String,
    pub metric: Metric,
}

impl HostMetric {
    pub fn metric_value(&self) -> HostMetricValue {
        HostMetricValue {
            host_id: self.host_id.clone(),
            value: MetricValue {
                name: self.metric.name.clone(),
                time: self.metric.timestamp.timestamp(),
                value: self.metric.value,
            },
        }
    }
}

impl fmt::Display for HostMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.metric.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMetric {
    pub service: String,
    pub metric: Metric,
}

impl ServiceMetric {
    pub fn metric_value(&self) -> MetricValue {
        MetricValue {
            name: self.metric.name.clone(),
            time: self.metric.timestamp.timestamp(),
            value: self.metric.value,
        }
    }
}

impl fmt::Display for ServiceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.metric.fmt(f)
    }
}

/// Wire shape for `POST /api/v0/services/:name/tsdb` and spill records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub time: i64,
    pub value: f64,
}

/// Wire shape for `POST /api/v0/tsdb` and spill records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetricValue {
    #[serde(rename = "hostId")]
    pub host_id: String,
    #[serde(flatten)]
    pub value: MetricValue,
}

#[derive(Debug, Error)]
pub enum MetricParseError {
    #[error("invalid metric format. insufficient columns")]
    InsufficientColumns,
    #[error("invalid metric format. name is empty")]
    EmptyName,
    #[error("invalid metric value: {0}")]
    InvalidValue(String),
    #[error("invalid metric time: {0}")]
    InvalidTime(String),
}

/// Parse one line of plugin output: `name \t value \t unix_seconds`
/// optionally followed by tab-separated `key=value` attribute pairs.
/// Fractional unix seconds are accepted and truncated.
pub fn parse_metric_line(line: &str) -> Result<Metric, MetricParseError> {
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() < 3 {
        return Err(MetricParseError::InsufficientColumns);
    }
    let (name, value, timestamp) = (cols[0], cols[1], cols[2]);
    if name.is_empty() {
        return Err(MetricParseError::EmptyName);
    }
    let value: f64 = value
        .parse()
        .map_err(|_| MetricParseError::InvalidValue(value.to_string()))?;
    let secs: f64 = timestamp
        .parse()
        .map_err(|_| MetricParseError::InvalidTime(timestamp.to_string()))?;
    let timestamp = Utc
        .timestamp_opt(secs as i64, 0)
        .single()
        .ok_or_else(|| MetricParseError::InvalidTime(timestamp.to_string()))?;

    let mut attribute = Attribute::default();
    for pair in &cols[3..] {
        match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                attribute.extra.insert(k.to_string(), v.to_string());
            }
            _ => {
                tracing::debug!(pair = %pair, "skipping malformed attribute pair");
            }
        }
    }

    Ok(Metric {
        name: name.to_string(),
        value,
        timestamp,
        attribute,
    })
}
