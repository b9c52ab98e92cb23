//! Mackerel API client, target-discovery cache and the Firehose spill
//! client.
//!
//! `find_hosts` keeps a process-wide cache keyed by the canonical JSON
//! of the selector; when the live API fails, the last successful
//! response for the same selector is served with a warning. Entries
//! never expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::metric::{HostMetricValue, MetricValue};
use crate::{METRIC_TIME_MARGIN, MAX_CLIENT_CONCURRENCY};

const DEFAULT_API_BASE: &str = "https://api.mackerelio.com";

static FIND_HOSTS_CACHE: Lazy<DashMap<String, Vec<Host>>> = Lazy::new(DashMap::new);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid selector: {0}")]
    Selector(#[from] serde_json::Error),
    #[error("firehose put failed: {0}")]
    Firehose(String),
}

/// A target host as returned by the Mackerel hosts API. Opaque apart
/// from the attributes referenced by template expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub custom_identifier: String,
    pub ip_addresses: HashMap<String, String>,
    pub metadata: Value,
    pub roles: HashMap<String, Vec<String>>,
    pub status: String,
}

impl Host {
    /// The JSON object template placeholders resolve against. The
    /// legacy capitalized form (`.Host.ID`, `.Host.Name`, ...) is
    /// exposed alongside the API field names.
    pub fn template_value(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut v {
            let legacy = json!({
                "ID": self.id,
                "Name": self.name,
                "CustomIdentifier": self.custom_identifier,
                "IPAddresses": self.ip_addresses,
                "Metadata": self.metadata,
                "Roles": self.roles,
                "Status": self.status,
            });
            map.insert("Host".to_string(), legacy);
        }
        v
    }
}

/// Selector for target discovery.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FindHostsParam {
    pub service: String,
    pub roles: Vec<String>,
    pub statuses: Vec<String>,
}

impl FindHostsParam {
    fn cache_key(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct HostsResponse {
    hosts: Vec<Host>,
}

#[derive(Debug, Deserialize)]
struct HostResponse {
    host: Host,
}

#[derive(Debug, Deserialize)]
struct HostMetricsResponse {
    metrics: Vec<TimeValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct TimeValue {
    time: f64,
    value: f64,
}

/// Graph definition payload for `POST /api/v0/graph-defs/create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefsParam {
    pub name: String,
    pub display_name: String,
    pub unit: String,
    pub metrics: Vec<GraphDefsMetric>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefsMetric {
    pub name: String,
    pub display_name: String,
    pub is_stacked: bool,
}

/// One record written to the spill stream (and read back by the
/// re-ingest endpoint).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_values: Option<Vec<MetricValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_metric_values: Option<Vec<HostMetricValue>>,
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_key: String,
    api_base: reqwest::Url,
    backup: Option<BackupClient>,
    client_sem: Arc<Semaphore>,
}

impl Client {
    /// Build a client. When `firehose_stream` is non-empty the AWS
    /// configuration is loaded and a spill client is attached.
    pub async fn new(api_key: &str, firehose_stream: &str) -> Self {
        let backup = if firehose_stream.is_empty() {
            None
        } else {
            info!(stream = firehose_stream, "setting backup firehose stream");
            let aws = aws_config::load_from_env().await;
            Some(BackupClient {
                svc: aws_sdk_firehose::Client::new(&aws),
                stream_name: firehose_stream.to_string(),
            })
        };
        let api_base = std::env::var("MACKEREL_APIBASE")
            .ok()
            .and_then(|s| reqwest::Url::parse(&s).ok())
            .unwrap_or_else(|| reqwest::Url::parse(DEFAULT_API_BASE).unwrap());
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_base,
            backup,
            client_sem: Arc::new(Semaphore::new(MAX_CLIENT_CONCURRENCY)),
        }
    }

    /// Point the client at a different API base (test fixtures).
    pub fn with_api_base(mut self, base: reqwest::Url) -> Self {
        self.api_base = base;
        self
    }

    pub fn backup(&self) -> Option<&BackupClient> {
        self.backup.as_ref()
    }

    fn url(&self, path: &str) -> reqwest::Url {
        let mut url = self.api_base.clone();
        url.set_path(path);
        url
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Discover hosts matching the selector, falling back to the last
    /// successful response for the same selector when the API fails.
    pub async fn find_hosts(&self, param: &FindHostsParam) -> Result<Vec<Host>, ClientError> {
        let key = param.cache_key()?;
        match self.find_hosts_live(param).await {
            Ok(hosts) => {
                FIND_HOSTS_CACHE.insert(key, hosts.clone());
                Ok(hosts)
            }
            Err(err) => match FIND_HOSTS_CACHE.get(&key) {
                Some(cached) => {
                    warn!(%err, "find hosts failed, using previous cache");
                    Ok(cached.clone())
                }
                None => Err(err),
            },
        }
    }

    async fn find_hosts_live(&self, param: &FindHostsParam) -> Result<Vec<Host>, ClientError> {
        let mut url = self.url("/api/v0/hosts");
        {
            let mut q = url.query_pairs_mut();
            if !param.service.is_empty() {
                q.append_pair("service", &param.service);
            }
            for role in &param.roles {
                q.append_pair("role", role);
            }
            for status in &param.statuses {
                q.append_pair("status", status);
            }
        }
        let resp = self
            .http
            .get(url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<HostsResponse>().await?.hosts)
    }

    /// Look up a single host by id (standalone probe invocations).
    pub async fn find_host(&self, id: &str) -> Result<Host, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/v0/hosts/{id}")))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<HostResponse>().await?.host)
    }

    pub async fn post_host_metric_values(&self, mvs: &[HostMetricValue]) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.url("/api/v0/tsdb"))
            .header("X-Api-Key", &self.api_key)
            .json(mvs)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn post_service_metric_values(
        &self,
        service: &str,
        mvs: &[MetricValue],
    ) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/v0/services/{service}/tsdb")))
            .header("X-Api-Key", &self.api_key)
            .json(mvs)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn create_graph_defs(&self, defs: &[GraphDefsParam]) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.url("/api/v0/graph-defs/create"))
            .header("X-Api-Key", &self.api_key)
            .json(defs)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Fetch the latest sample of every `(host, metric)` pair in the
    /// window `[now-4min, now-1min]`. Calls run in parallel, bounded by
    /// the client concurrency semaphore so the API is not overloaded.
    /// Individual failures are logged and leave a gap in the result.
    pub async fn fetch_latest_metric_values(
        &self,
        host_ids: &[String],
        metric_names: &[String],
    ) -> HashMap<String, HashMap<String, MetricValue>> {
        let to = Utc::now() - chrono::Duration::minutes(1);
        let from = to - chrono::Duration::from_std(METRIC_TIME_MARGIN).unwrap_or_default();

        let mut tasks = JoinSet::new();
        for host_id in host_ids {
            for name in metric_names {
                let client = self.clone();
                let host_id = host_id.clone();
                let name = name.clone();
                let (from, to) = (from.timestamp(), to.timestamp());
                tasks.spawn(async move {
                    let _permit = client.client_sem.acquire().await;
                    debug!(%host_id, metric = name, from, to, "fetching host metric values");
                    match client.fetch_host_metric_values(&host_id, &name, from, to).await {
                        Ok(values) => values
                            .last()
                            .map(|tv| (host_id, name.clone(), MetricValue {
                                name,
                                time: tv.time as i64,
                                value: tv.value,
                            })),
                        Err(err) => {
                            warn!(%err, %host_id, metric = name, "failed to fetch host metric values");
                            None
                        }
                    }
                });
            }
        }

        let mut result: HashMap<String, HashMap<String, MetricValue>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some((host_id, name, mv))) = joined {
                result.entry(host_id).or_default().insert(name, mv);
            }
        }
        result
    }

    async fn fetch_host_metric_values(
        &self,
        host_id: &str,
        name: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<TimeValue>, ClientError> {
        let mut url = self.url(&format!("/api/v0/hosts/{host_id}/metrics"));
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("from", &from.to_string())
            .append_pair("to", &to.to_string());
        let resp = self
            .http
            .get(url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = Self::check(resp).await?;
        Ok(resp.json::<HostMetricsResponse>().await?.metrics)
    }
}

/// Spill client writing one record per exhausted post-batch to a
/// Firehose delivery stream.
#[derive(Clone)]
pub struct BackupClient {
    svc: aws_sdk_firehose::Client,
    stream_name: String,
}

impl BackupClient {
    pub async fn post_service_metric_values(
        &self,
        service: &str,
        mvs: &[MetricValue],
    ) -> Result<(), ClientError> {
        info!(count = mvs.len(), stream = %self.stream_name, "post service metrics to backup stream");
        self.put_record(&BackupPayload {
            service: Some(service.to_string()),
            metric_values: Some(mvs.to_vec()),
            host_metric_values: None,
        })
        .await
    }

    pub async fn post_host_metric_values(&self, mvs: &[HostMetricValue]) -> Result<(), ClientError> {
        info!(count = mvs.len(), stream = %self.stream_name, "post host metrics to backup stream");
        self.put_record(&BackupPayload {
            service: None,
            metric_values: None,
            host_metric_values: Some(mvs.to_vec()),
        })
        .await
    }

    async fn put_record(&self, payload: &BackupPayload) -> Result<(), ClientError> {
        let data = serde_json::to_vec(payload).map_err(|e| ClientError::Firehose(e.to_string()))?;
        let record = aws_sdk_firehose::types::Record::builder()
            .data(aws_sdk_firehose::primitives::Blob::new(data))
            .build()
            .map_err(|e| ClientError::Firehose(e.to_string()))?;
        self.svc
            .put_record()
            .delivery_stream_name(&self.stream_name)
            .record(record)
            .send()
            .await
            .map_err(|e| ClientError::Firehose(e.to_string()))?;
        Ok(())
    }
}

/// Capped-exponential retry policy for upstream posts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_count: 5,
        }
    }
}

/// Invoke `f` until it succeeds or the policy is exhausted, sleeping a
/// doubling delay (capped at `max_delay`) between attempts.
pub async fn do_retry<T, E, F, Fut>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut delay = policy.min_delay;
    let mut last_err = None;
    for attempt in 0..policy.max_count {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                warn!(%err, "retrying");
                last_err = Some(err);
            }
        }
        if attempt + 1 < policy.max_count {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(policy.max_delay);
        }
    }
    Err(last_err.expect("max_count must be at least 1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::future::IntoFuture;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        addr
    }

    async fn test_client(addr: SocketAddr) -> Client {
        Client::new("test-key", "")
            .await
            .with_api_base(reqwest::Url::parse(&format!("http://{addr}")).unwrap())
    }

    #[tokio::test]
    async fn find_hosts_serves_cache_on_failure() {
        let failing = Arc::new(AtomicBool::new(false));
        let state = failing.clone();
        let router = Router::new().route(
            "/api/v0/hosts",
            get(|State(fail): State<Arc<AtomicBool>>| async move {
                if fail.load(Ordering::SeqCst) {
                    Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                } else {
                    Ok(Json(serde_json::json!({
                        "hosts": [{"id": "h-1", "name": "web01", "status": "working"}]
                    })))
                }
            })
            .with_state(state),
        );
        let addr = serve(router).await;
        let client = test_client(addr).await;

        let param = FindHostsParam {
            service: format!("cache-test-{addr}"),
            roles: vec!["web".to_string()],
            statuses: vec![],
        };

        let hosts = client.find_hosts(&param).await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id, "h-1");

        failing.store(true, Ordering::SeqCst);
        let cached = client.find_hosts(&param).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, "h-1");

        // a selector that never succeeded surfaces the failure
        let fresh = FindHostsParam {
            service: format!("cache-test-miss-{addr}"),
            ..Default::default()
        };
        assert!(client.find_hosts(&fresh).await.is_err());
    }

    #[tokio::test]
    async fn fetch_latest_takes_the_newest_sample() {
        let router = Router::new().route(
            "/api/v0/hosts/{id}/metrics",
            get(|| async {
                Json(serde_json::json!({
                    "metrics": [
                        {"time": 1_700_000_000, "value": 1.0},
                        {"time": 1_700_000_060, "value": 2.5},
                    ]
                }))
            }),
        );
        let addr = serve(router).await;
        let client = test_client(addr).await;

        let latest = client
            .fetch_latest_metric_values(
                &["h-1".to_string()],
                &["custom.nginx.requests".to_string()],
            )
            .await;
        let mv = &latest["h-1"]["custom.nginx.requests"];
        assert_eq!(mv.value, 2.5);
        assert_eq!(mv.time, 1_700_000_060);
    }

    #[tokio::test(start_paused = true)]
    async fn do_retry_backs_off_and_gives_up() {
        let tries = Arc::new(AtomicU32::new(0));
        let counter = tries.clone();
        let start = tokio::time::Instant::now();
        let result: Result<(), String> = do_retry(&RetryPolicy::default(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("post failed".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert!(tries.load(Ordering::SeqCst) >= 2);
        assert_eq!(tries.load(Ordering::SeqCst), 5);
        // 1 + 2 + 4 + 8 seconds of backoff
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn do_retry_returns_first_success() {
        let tries = Arc::new(AtomicU32::new(0));
        let counter = tries.clone();
        let result: Result<u32, String> = do_retry(&RetryPolicy::default(), move || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
        })
        .await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(tries.load(Ordering::SeqCst), 1);
    }
}
