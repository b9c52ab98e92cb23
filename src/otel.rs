//! OTLP metric export: exporter construction shared by the OTel
//! poster and the stats collector, plus the manual gauge batching used
//! by the poster.

use std::time::Duration;

use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_otlp::{Compression, MetricExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::metrics::data;
use opentelemetry_sdk::Resource;

use crate::config::OtelConfig;
use crate::metric::Metric;

const DEFAULT_OTLP_ENDPOINT: &str = "localhost:4317";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// The endpoint URL the exporter will talk to. TLS by default;
/// `insecure` switches the transport to plaintext.
pub fn endpoint_url(oc: &OtelConfig) -> String {
    let host = if oc.endpoint.is_empty() {
        DEFAULT_OTLP_ENDPOINT
    } else {
        &oc.endpoint
    };
    let scheme = if oc.insecure { "http" } else { "https" };
    format!("{scheme}://{host}")
}

/// Build the OTLP gRPC metric exporter: gzip-compressed, API key in
/// the `Mackerel-Api-Key` header.
pub fn new_exporter(oc: &OtelConfig, api_key: &str) -> anyhow::Result<MetricExporter> {
    let mut metadata = tonic::metadata::MetadataMap::new();
    metadata.insert("mackerel-api-key", api_key.parse()?);
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint_url(oc))
        .with_metadata(metadata)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;
    Ok(exporter)
}

pub fn resource_from(attributes: &std::collections::HashMap<String, String>) -> Resource {
    Resource::new(
        attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
    )
}

/// Wrap a batch of samples into one ResourceMetrics for export, each
/// sample encoded as a single-point gauge.
pub fn build_resource_metrics(resource: &Resource, batch: &[Metric]) -> data::ResourceMetrics {
    data::ResourceMetrics {
        resource: resource.clone(),
        scope_metrics: vec![data::ScopeMetrics {
            scope: InstrumentationScope::builder("mkrprobe").build(),
            metrics: batch.iter().map(Metric::otel_data).collect(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Attribute;

    #[test]
    fn endpoint_defaults_and_insecure_toggle() {
        let mut oc = OtelConfig::default();
        assert_eq!(endpoint_url(&oc), "https://localhost:4317");
        oc.endpoint = "otlp.example.com:4317".to_string();
        assert_eq!(endpoint_url(&oc), "https://otlp.example.com:4317");
        oc.insecure = true;
        assert_eq!(endpoint_url(&oc), "http://otlp.example.com:4317");
    }

    #[test]
    fn batches_encode_one_gauge_per_sample() {
        let resource = resource_from(&std::collections::HashMap::new());
        let ms = vec![
            Metric {
                attribute: Attribute {
                    service: "prod".to_string(),
                    host_id: "h1".to_string(),
                    extra: Default::default(),
                },
                ..Metric::new("ping.rtt.min", 0.01)
            },
            Metric::new("ping.rtt.max", 0.02),
        ];
        let rm = build_resource_metrics(&resource, &ms);
        assert_eq!(rm.scope_metrics.len(), 1);
        assert_eq!(rm.scope_metrics[0].metrics.len(), 2);
        assert_eq!(rm.scope_metrics[0].metrics[0].name, "ping.rtt.min");
    }
}
