//! HTTP endpoint ingesting spill-stream deliveries and re-posting the
//! contained metrics to Mackerel.
//!
//! Firehose HTTP delivery posts `{requestId, timestamp, records:[{data:
//! base64}]}`; each record decodes to one spill payload. The access key
//! header must match the agent's API key. Responses are always JSON.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Json;
use axum::routing::any;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{BackupPayload, Client};

const ACCESS_KEY_HEADER: &str = "x-amz-firehose-access-key";
const REQUEST_ID_HEADER: &str = "x-amz-firehose-request-id";

#[derive(Clone)]
struct EndpointState {
    api_key: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirehoseRequest {
    #[serde(default)]
    records: Vec<FirehoseRecord>,
}

#[derive(Debug, Deserialize)]
struct FirehoseRecord {
    data: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct FirehoseResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    request_id: String,
    timestamp: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    error_message: String,
}

/// Serve the endpoint until cancellation.
pub async fn run_endpoint(
    cancel: CancellationToken,
    port: u16,
    api_key: String,
) -> anyhow::Result<()> {
    let client = Client::new(&api_key, "").await; // no backup: never spill back to ourselves
    let router = router(EndpointState { api_key, client });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "starting firehose endpoint");
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("stopping firehose endpoint");
    Ok(())
}

fn router(state: EndpointState) -> Router {
    Router::new()
        .route("/", any(handle))
        .route("/post", any(handle))
        .with_state(state)
}

async fn handle(
    State(state): State<EndpointState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<FirehoseResponse>) {
    let mut resp = FirehoseResponse {
        request_id: headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        ..Default::default()
    };
    let status = process(&state, &method, &headers, &body, &mut resp).await;
    if !resp.error_message.is_empty() {
        error!(error = %resp.error_message, "firehose endpoint request failed");
    }
    resp.timestamp = Utc::now().timestamp_millis();
    (status, Json(resp))
}

async fn process(
    state: &EndpointState,
    method: &Method,
    headers: &HeaderMap,
    body: &Bytes,
    resp: &mut FirehoseResponse,
) -> StatusCode {
    if method != Method::POST {
        resp.error_message = "POST method required".to_string();
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    let access_key = headers
        .get(ACCESS_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if access_key != state.api_key {
        resp.error_message = "invalid access key".to_string();
        return StatusCode::BAD_REQUEST;
    }
    let request: FirehoseRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            resp.error_message = format!("failed to decode request body: {err}");
            return StatusCode::BAD_REQUEST;
        }
    };

    for record in &request.records {
        let decoded = match BASE64.decode(&record.data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "failed to decode record data");
                continue;
            }
        };
        debug!(record = %String::from_utf8_lossy(&decoded), "firehose record");
        let payload: BackupPayload = match serde_json::from_slice(&decoded) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to parse payload");
                continue;
            }
        };
        if let Err(status) = reinject(&state.client, &payload, resp).await {
            return status;
        }
    }
    StatusCode::OK
}

async fn reinject(
    client: &Client,
    payload: &BackupPayload,
    resp: &mut FirehoseResponse,
) -> Result<(), StatusCode> {
    match payload.service.as_deref() {
        Some(service) if !service.is_empty() => {
            let mvs = payload.metric_values.as_deref().unwrap_or_default();
            info!(count = mvs.len(), service, "reposting service metrics");
            if let Err(err) = client.post_service_metric_values(service, mvs).await {
                resp.error_message = err.to_string();
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
        _ => {
            let mvs = payload.host_metric_values.as_deref().unwrap_or_default();
            info!(count = mvs.len(), "reposting host metrics");
            if let Err(err) = client.post_host_metric_values(mvs).await {
                resp.error_message = err.to_string();
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::post;
    use std::future::IntoFuture;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Upstream {
        posted: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        failing: Arc<AtomicBool>,
    }

    async fn upstream_server(upstream: Upstream) -> SocketAddr {
        let router = Router::new()
            .route(
                "/api/v0/tsdb",
                post(|State(u): State<Upstream>, Json(v): Json<serde_json::Value>| async move {
                    if u.failing.load(Ordering::SeqCst) {
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    u.posted.lock().unwrap().push(("<host>".to_string(), v));
                    Ok(Json(serde_json::json!({"success": true})))
                }),
            )
            .route(
                "/api/v0/services/{service}/tsdb",
                post(
                    |State(u): State<Upstream>,
                     Path(service): Path<String>,
                     Json(v): Json<serde_json::Value>| async move {
                        if u.failing.load(Ordering::SeqCst) {
                            return Err(StatusCode::INTERNAL_SERVER_ERROR);
                        }
                        u.posted.lock().unwrap().push((service, v));
                        Ok(Json(serde_json::json!({"success": true})))
                    },
                ),
            )
            .with_state(upstream);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        addr
    }

    async fn endpoint(upstream_addr: SocketAddr) -> SocketAddr {
        let client = Client::new("secret-key", "")
            .await
            .with_api_base(reqwest::Url::parse(&format!("http://{upstream_addr}")).unwrap());
        let router = router(EndpointState {
            api_key: "secret-key".to_string(),
            client,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        addr
    }

    fn delivery_body() -> serde_json::Value {
        let service_record = serde_json::json!({
            "service": "prod",
            "metric_values": [{"name": "custom.app.ok", "time": 1523261168, "value": 1.0}],
        });
        let host_record = serde_json::json!({
            "host_metric_values": [
                {"hostId": "h-1", "name": "http.check.ok", "time": 1523261168, "value": 1.0}
            ],
        });
        serde_json::json!({
            "requestId": "req-1",
            "timestamp": 1523261168000i64,
            "records": [
                {"data": BASE64.encode(service_record.to_string())},
                {"data": BASE64.encode(host_record.to_string())},
            ],
        })
    }

    #[tokio::test]
    async fn reinjects_service_and_host_records() {
        let upstream = Upstream::default();
        let upstream_addr = upstream_server(upstream.clone()).await;
        let addr = endpoint(upstream_addr).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/post"))
            .header("X-Amz-Firehose-Access-Key", "secret-key")
            .header("X-Amz-Firehose-Request-Id", "req-1")
            .json(&delivery_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "application/json");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["requestId"], "req-1");
        assert!(body["timestamp"].as_i64().unwrap() > 0);

        let posted = upstream.posted.lock().unwrap();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].0, "prod");
        assert_eq!(posted[1].0, "<host>");
    }

    #[tokio::test]
    async fn rejects_non_post_and_bad_credentials() {
        let upstream_addr = upstream_server(Upstream::default()).await;
        let addr = endpoint(upstream_addr).await;
        let http = reqwest::Client::new();

        let resp = http.get(format!("http://{addr}/")).send().await.unwrap();
        assert_eq!(resp.status(), 405);
        assert_eq!(resp.headers()["content-type"], "application/json");

        let resp = http
            .post(format!("http://{addr}/post"))
            .header("X-Amz-Firehose-Access-Key", "wrong")
            .json(&delivery_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = http
            .post(format!("http://{addr}/post"))
            .header("X-Amz-Firehose-Access-Key", "secret-key")
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn downstream_failure_maps_to_unavailable() {
        let upstream = Upstream::default();
        upstream.failing.store(true, Ordering::SeqCst);
        let upstream_addr = upstream_server(upstream).await;
        let addr = endpoint(upstream_addr).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/post"))
            .header("X-Amz-Firehose-Access-Key", "secret-key")
            .json(&delivery_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["errorMessage"].as_str().unwrap().contains("API error"));
    }
}
