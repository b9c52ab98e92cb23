//! gRPC probe: standard `grpc.health.v1.Health/Check` against the
//! target, optionally over TLS and with outgoing metadata attached.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::{ClientTlsConfig, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{new_metric, ProbeError, ProbeResult};
use crate::client::Host;
use crate::config::duration_opt;
use crate::metric::Metric;
use crate::template;

const DEFAULT_GRPC_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_GRPC_PREFIX: &str = "grpc";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcProbeConfig {
    pub address: String,
    #[serde(default)]
    pub grpc_service: String,
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub no_check_certificate: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub metric_key_prefix: Option<String>,
}

impl GrpcProbeConfig {
    pub fn generate_probe(&self, host: &Host) -> Result<GrpcProbe, ProbeError> {
        let value = host.template_value();
        let mut metadata = HashMap::with_capacity(self.metadata.len());
        for (key, raw) in &self.metadata {
            metadata.insert(key.clone(), template::expand(raw, Some(&value), None)?);
        }
        Ok(GrpcProbe {
            address: template::expand(&self.address, Some(&value), None)?,
            grpc_service: template::expand(&self.grpc_service, Some(&value), None)?,
            timeout: self.timeout.unwrap_or(DEFAULT_GRPC_TIMEOUT),
            tls: self.tls,
            no_check_certificate: self.no_check_certificate,
            metadata,
            prefix: self
                .metric_key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_GRPC_PREFIX.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GrpcProbe {
    pub address: String,
    pub grpc_service: String,
    pub timeout: Duration,
    pub tls: bool,
    pub no_check_certificate: bool,
    pub metadata: HashMap<String, String>,
    prefix: String,
}

impl GrpcProbe {
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
        debug!(ok = outcome.is_ok(), "grpc probe completed");
        ProbeResult {
            metrics: ms,
            error: outcome.err(),
        }
    }

    async fn attempt(&self, ms: &mut Vec<Metric>) -> Result<(), ProbeError> {
        let scheme = if self.tls { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.address))
            .map_err(|e| ProbeError::Config(format!("invalid address: {e}")))?
            .timeout(self.timeout)
            .connect_timeout(self.timeout);
        if self.tls {
            if self.no_check_certificate {
                // the transport always verifies; unverified TLS is not supported
                warn!(address = %self.address, "no_check_certificate is ignored for grpc probes");
            }
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| ProbeError::Tls(e.to_string()))?;
        }

        debug!(address = %self.address, "dialing grpc");
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;
        let mut client = HealthClient::new(channel);

        let mut request = tonic::Request::new(HealthCheckRequest {
            service: self.grpc_service.clone(),
        });
        for (key, value) in &self.metadata {
            let key = MetadataKey::from_bytes(key.to_lowercase().as_bytes())
                .map_err(|e| ProbeError::Config(format!("invalid metadata key: {e}")))?;
            let value: MetadataValue<_> = value
                .parse()
                .map_err(|_| ProbeError::Config("invalid metadata value".to_string()))?;
            request.metadata_mut().insert(key, value);
        }

        debug!(grpc_service = %self.grpc_service, "health check");
        match client.check(request).await {
            Ok(resp) => {
                ms.push(self.metric("status.code", 0.0));
                let status = resp.into_inner().status();
                if status != ServingStatus::Serving {
                    return Err(ProbeError::NotServing(format!("{status:?}")));
                }
                Ok(())
            }
            Err(status) => {
                ms.push(self.metric("status.code", status.code() as i32 as f64));
                Err(ProbeError::Health {
                    code: status.code(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::TcpListenerStream;

    fn values(result: &ProbeResult) -> HashMap<String, f64> {
        result
            .metrics
            .iter()
            .map(|m| (m.name.clone(), m.value))
            .collect()
    }

    async fn health_server() -> u16 {
        let (mut reporter, service) = tonic_health::server::health_reporter();
        reporter
            .set_service_status("", tonic_health::ServingStatus::Serving)
            .await;
        reporter
            .set_service_status("probe.test.Ready", tonic_health::ServingStatus::Serving)
            .await;
        reporter
            .set_service_status("probe.test.Draining", tonic_health::ServingStatus::NotServing)
            .await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        port
    }

    fn probe(port: u16, service: &str) -> GrpcProbe {
        GrpcProbeConfig {
            address: format!("127.0.0.1:{port}"),
            grpc_service: service.to_string(),
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        }
        .generate_probe(&Host::default())
        .unwrap()
    }

    #[tokio::test]
    async fn serving_service_checks_ok() {
        let port = health_server().await;
        let result = probe(port, "").run(&CancellationToken::new()).await;
        assert!(result.error.is_none(), "error: {:?}", result.error);
        let vs = values(&result);
        assert_eq!(vs["grpc.status.code"], 0.0);
        assert_eq!(vs["grpc.check.ok"], 1.0);
        assert!(vs.contains_key("grpc.elapsed.seconds"));
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let port = health_server().await;
        let result = probe(port, "probe.test.Missing")
            .run(&CancellationToken::new())
            .await;
        match result.error {
            Some(ProbeError::Health { code }) => assert_eq!(code, tonic::Code::NotFound),
            other => panic!("expected NotFound, got {other:?}"),
        }
        let vs = values(&result);
        assert_eq!(vs["grpc.status.code"], tonic::Code::NotFound as i32 as f64);
        assert_eq!(vs["grpc.check.ok"], 0.0);
    }

    #[tokio::test]
    async fn not_serving_service_fails_the_check() {
        let port = health_server().await;
        let result = probe(port, "probe.test.Draining")
            .run(&CancellationToken::new())
            .await;
        assert!(matches!(result.error, Some(ProbeError::NotServing(_))));
        let vs = values(&result);
        assert_eq!(vs["grpc.status.code"], 0.0);
        assert_eq!(vs["grpc.check.ok"], 0.0);
    }

    #[tokio::test]
    async fn unreachable_target_reports_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = probe(port, "").run(&CancellationToken::new()).await;
        assert!(result.error.is_some());
        assert_eq!(values(&result)["grpc.check.ok"], 0.0);
    }
}
