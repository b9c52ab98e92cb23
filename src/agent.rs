//! The orchestration engine: run loop, probe scheduler, aggregation
//! engine and the upstream posting workers.
//!
//! One tick spawns a task per probe definition and per aggregate
//! definition, waits for all of them, then sleeps until the next tick
//! and reloads the configuration when its digest changed. Samples flow
//! through the fan-out channels into long-running posters which batch,
//! retry and finally spill to the backup stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::Receiver;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::{self, Channels, Receivers};
use crate::client::{do_retry, Client, FindHostsParam, RetryPolicy};
use crate::config::{ex_strings, AggregateDefinition, Config, OtelConfig, ProbeDefinition};
use crate::metric::{HostMetric, Metric, MetricValue, ServiceMetric};
use crate::probe::Probe;
use crate::stats::Stats;
use crate::{otel, MAX_CONCURRENCY, METRIC_TIME_MARGIN, POST_METRIC_BUFFER_LENGTH};

const POST_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Run the agent until cancellation (or a single tick when `once`).
pub async fn run(
    cancel: CancellationToken,
    config_path: &str,
    once: bool,
    api_key: &str,
    probe_interval: Duration,
) -> anyhow::Result<()> {
    info!("starting mkrprobe");
    let (mut conf, mut digest) = Config::load(config_path).await?;
    debug!(config = %conf.to_json());

    let client = Client::new(api_key, &conf.backup.firehose_stream_name).await;
    let stats = Stats::new(&conf.destination.otel, api_key)?;
    let (chs, rxs) = channels::new(&conf.destination);
    let workers = spawn_workers(&conf, &client, api_key, rxs);

    let chs = Arc::new(chs);
    let sem = Arc::new(Semaphore::new(MAX_CONCURRENCY));

    let mut ticker = tokio::time::interval(probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // the first tick completes immediately

    loop {
        stats.set_probe_configs(conf.probes.len() as i64);
        let mut tick_tasks: JoinSet<(usize, usize)> = JoinSet::new();
        for pd in conf.probes.clone() {
            let (client, chs, sem, stats, cancel) = (
                client.clone(),
                Arc::clone(&chs),
                Arc::clone(&sem),
                stats.clone(),
                cancel.clone(),
            );
            tick_tasks.spawn(run_probe_definition(
                pd,
                client,
                chs,
                sem,
                stats,
                probe_interval,
                cancel,
            ));
        }
        for ag in conf.aggregates.clone() {
            let (client, chs, stats) = (client.clone(), Arc::clone(&chs), stats.clone());
            tick_tasks.spawn(async move {
                run_aggregate_definition(ag, client, chs, stats).await;
                (0, 0)
            });
        }

        let (mut target_hosts, mut target_services) = (0usize, 0usize);
        while let Some(joined) = tick_tasks.join_next().await {
            if let Ok((hosts, services)) = joined {
                target_hosts += hosts;
                target_services += services;
            }
        }
        stats.set_target_counts(target_hosts as i64, target_services as i64);

        if once {
            break;
        }

        debug!("waiting for a next tick");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!("checking a new config");
        match Config::load(config_path).await {
            Err(err) => {
                warn!(%err);
                warn!("still using current config");
            }
            Ok((new_conf, new_digest)) => {
                if new_digest != digest {
                    conf = new_conf;
                    digest = new_digest;
                    info!("config reloaded");
                    debug!(config = %conf.to_json());
                }
            }
        }
    }

    // producers first: closing the channels tells the posters to
    // drain their buffers and exit
    drop(chs);
    for worker in workers {
        let _ = worker.await;
    }
    stats.shutdown();
    info!("stopping mkrprobe");
    Ok(())
}

fn spawn_workers(
    conf: &Config,
    client: &Client,
    api_key: &str,
    rxs: Receivers,
) -> Vec<JoinHandle<()>> {
    let Receivers {
        host_metrics,
        service_metrics,
        aggregated_metrics,
        otel_metrics,
    } = rxs;
    let mut workers = Vec::new();
    let policy = RetryPolicy::default();

    if !conf.probes.is_empty() {
        if conf.post_probed_metrics {
            if conf.destination.mackerel.enabled {
                workers.push(tokio::spawn(post_host_metric_worker(
                    client.clone(),
                    host_metrics,
                    policy,
                )));
                workers.push(tokio::spawn(post_service_metric_worker(
                    client.clone(),
                    service_metrics,
                    policy,
                )));
            }
            if conf.destination.otel.enabled {
                workers.push(tokio::spawn(post_otel_metric_worker(
                    otel_metrics,
                    conf.destination.otel.clone(),
                    api_key.to_string(),
                    policy,
                )));
            }
        } else {
            if conf.destination.mackerel.enabled {
                workers.push(tokio::spawn(dump_host_metric_worker(host_metrics)));
                workers.push(tokio::spawn(dump_service_metric_worker(service_metrics)));
            }
            if conf.destination.otel.enabled {
                workers.push(tokio::spawn(dump_otel_metric_worker(otel_metrics)));
            }
        }
    }

    if !conf.aggregates.is_empty() {
        if conf.post_aggregated_metrics {
            if conf.destination.mackerel.enabled {
                // aggregates are posted to Mackerel only
                workers.push(tokio::spawn(post_service_metric_worker(
                    client.clone(),
                    aggregated_metrics,
                    policy,
                )));
            }
        } else {
            workers.push(tokio::spawn(dump_service_metric_worker(aggregated_metrics)));
        }
    }

    workers
}

/// Resolve targets for one probe definition and run every configured
/// probe against each of them. Returns `(host, service)` target counts
/// for self-observation.
async fn run_probe_definition(
    pd: ProbeDefinition,
    client: Client,
    chs: Arc<Channels>,
    sem: Arc<Semaphore>,
    stats: Stats,
    probe_interval: Duration,
    cancel: CancellationToken,
) -> (usize, usize) {
    let service = pd.service.to_string();

    if pd.is_service_metric {
        let Ok(_permit) = sem.acquire().await else {
            return (0, 0);
        };
        let host = crate::client::Host {
            id: service.clone(),
            name: service.clone(),
            ..Default::default()
        };
        run_probes_for_host(&pd, &host, &client, &chs, &stats, &cancel, true).await;
        return (0, 1);
    }

    let param = FindHostsParam {
        service: service.clone(),
        roles: ex_strings(&pd.roles),
        statuses: ex_strings(&pd.statuses),
    };
    debug!(%service, roles = ?param.roles, statuses = ?param.statuses, "finding hosts");
    let hosts = match client.find_hosts(&param).await {
        Ok(hosts) => hosts,
        Err(err) => {
            error!(%err, %service, "find hosts failed");
            return (0, 0);
        }
    };
    debug!(count = hosts.len(), %service, "hosts found");
    if hosts.is_empty() {
        return (0, 0);
    }

    // stagger per-host starts so one definition cannot monopolize the
    // concurrency slots at the top of each tick
    let spawn_interval = (probe_interval / (hosts.len() as u32 * 2)).min(Duration::from_secs(1));

    let host_count = hosts.len();
    let mut host_tasks = JoinSet::new();
    for host in hosts {
        tokio::time::sleep(spawn_interval).await;
        if cancel.is_cancelled() {
            break;
        }
        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
            break;
        };
        let (pd, client, chs, stats, cancel) = (
            pd.clone(),
            client.clone(),
            Arc::clone(&chs),
            stats.clone(),
            cancel.clone(),
        );
        host_tasks.spawn(async move {
            let _permit = permit;
            debug!(host_id = %host.id, host = %host.name, "probing host");
            run_probes_for_host(&pd, &host, &client, &chs, &stats, &cancel, false).await;
        });
    }
    while host_tasks.join_next().await.is_some() {}
    (host_count, 0)
}

async fn run_probes_for_host(
    pd: &ProbeDefinition,
    host: &crate::client::Host,
    client: &Client,
    chs: &Channels,
    stats: &Stats,
    cancel: &CancellationToken,
    as_service_metric: bool,
) {
    let service = pd.service.to_string();
    let host_value = host.template_value();
    for probe in pd.generate_probes(host) {
        if let Probe::Command(command) = &probe {
            if command.graph_defs {
                if let Err(err) = command.post_graph_defs(client).await {
                    warn!(%err, "failed to post graph defs");
                }
            }
        }

        let result = probe.run(cancel).await;
        stats.record_probe_execution(probe.probe_type(), result.error.is_none());
        if let Some(err) = &result.error {
            warn!(%err, %service, host_id = %host.id, probe = probe.probe_type(), "probe failed");
        }
        for mut m in result.metrics {
            m.attribute.service = service.clone();
            m.attribute.host_id = host.id.clone();
            m.attribute.set_extra(&pd.attributes, Some(&host_value));
            stats.record_metric_collected();
            if as_service_metric {
                chs.send_service_metric(m.service_metric(service.clone())).await;
            } else {
                chs.send_host_metric(m.host_metric(host.id.clone())).await;
            }
        }
    }
}

/// Fetch the role's latest samples, compute the configured summary
/// outputs and emit them as service metrics.
async fn run_aggregate_definition(
    ag: AggregateDefinition,
    client: Client,
    chs: Arc<Channels>,
    stats: Stats,
) {
    let service = ag.service.to_string();
    let param = FindHostsParam {
        service: service.clone(),
        roles: ex_strings(&ag.roles),
        statuses: ex_strings(&ag.statuses),
    };
    debug!(%service, roles = ?param.roles, statuses = ?param.statuses, "aggregates finding hosts");
    let hosts = match client.find_hosts(&param).await {
        Ok(hosts) => hosts,
        Err(err) => {
            error!(%err, %service, "aggregates find hosts failed");
            return;
        }
    };
    debug!(count = hosts.len(), "aggregates hosts found");

    let host_ids: Vec<String> = hosts.iter().map(|h| h.id.clone()).collect();
    let metric_names: Vec<String> = ag.metrics.iter().map(|m| m.name.to_string()).collect();
    debug!(hosts = ?host_ids, metrics = ?metric_names, "fetching latest metrics");
    let latest = client.fetch_latest_metric_values(&host_ids, &metric_names).await;

    let now = Utc::now();
    let oldest = now - chrono::Duration::from_std(METRIC_TIME_MARGIN).unwrap_or_default();
    for mc in &ag.metrics {
        let name = mc.name.as_str();
        let mut timestamp = 0i64;
        let mut values = Vec::new();
        for (host_id, metrics) in &latest {
            let Some(mv) = metrics.get(name) else { continue };
            let ts = DateTime::<Utc>::from_timestamp(mv.time, 0).unwrap_or(oldest);
            if ts > oldest {
                values.push(mv.value);
                timestamp = timestamp.max(mv.time);
            } else {
                warn!(%host_id, metric = name, time = mv.time, "latest value is outdated");
            }
        }
        if !hosts.is_empty() && values.is_empty() {
            warn!(%service, metric = name, "latest values are not found");
        }

        for output in &mc.outputs {
            let Some(calc) = output.calc else { continue };
            let value = if values.is_empty() {
                if !output.emit_zero {
                    continue;
                }
                timestamp = (now - chrono::Duration::minutes(1)).timestamp();
                0.0
            } else {
                calc(&values)
            };
            debug!(
                func = %output.func, metric = name, value,
                %service, output = %output.name, timestamp,
                "aggregated"
            );
            let m = Metric {
                name: output.name.to_string(),
                value,
                timestamp: DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or(now),
                attribute: crate::metric::Attribute {
                    service: service.clone(),
                    ..Default::default()
                },
            };
            stats.record_metric_collected();
            chs.send_aggregated_metric(m.service_metric(service.clone())).await;
        }
    }
}

async fn post_host_metric_worker(client: Client, mut rx: Receiver<HostMetric>, policy: RetryPolicy) {
    info!("starting post host metric worker");
    let mut ticker = tokio::time::interval(POST_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffer = Vec::with_capacity(POST_METRIC_BUFFER_LENGTH);
    let mut running = true;
    while running {
        tokio::select! {
            received = rx.recv() => match received {
                Some(m) => {
                    buffer.push(m.metric_value());
                    if buffer.len() < POST_METRIC_BUFFER_LENGTH {
                        continue;
                    }
                }
                None => {
                    info!("shutting down post host metric worker");
                    running = false;
                }
            },
            _ = ticker.tick() => {}
        }
        if buffer.is_empty() {
            continue;
        }
        debug!(count = buffer.len(), "posting host metrics to Mackerel");
        match do_retry(&policy, || client.post_host_metric_values(&buffer)).await {
            Ok(()) => debug!("post host metrics succeeded"),
            Err(err) => {
                error!(%err, "failed to post host metrics to Mackerel");
                match client.backup() {
                    Some(backup) => {
                        if let Err(err) = backup.post_host_metric_values(&buffer).await {
                            error!(%err, "failed to post host metrics to backup stream");
                        }
                    }
                    None => warn!(dropped = buffer.len(), "dropping host metrics"),
                }
            }
        }
        buffer.clear();
    }
}

async fn post_service_metric_worker(
    client: Client,
    mut rx: Receiver<ServiceMetric>,
    policy: RetryPolicy,
) {
    info!("starting post service metric worker");
    let mut ticker = tokio::time::interval(POST_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffers: std::collections::HashMap<String, Vec<MetricValue>> =
        std::collections::HashMap::new();
    let mut running = true;
    while running {
        tokio::select! {
            received = rx.recv() => match received {
                Some(m) => {
                    if m.metric.value.is_nan() {
                        warn!(
                            service = %m.service, metric = %m.metric.name,
                            "value NaN is not supported by Mackerel"
                        );
                        continue;
                    }
                    let buffer = buffers.entry(m.service.clone()).or_default();
                    buffer.push(m.metric_value());
                    if buffer.len() < POST_METRIC_BUFFER_LENGTH {
                        continue;
                    }
                }
                None => {
                    info!("shutting down post service metric worker");
                    running = false;
                }
            },
            _ = ticker.tick() => {}
        }
        for (service, buffer) in buffers.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            debug!(count = buffer.len(), %service, "posting service metrics to Mackerel");
            match do_retry(&policy, || client.post_service_metric_values(service, buffer)).await {
                Ok(()) => debug!(%service, "post service metrics succeeded"),
                Err(err) => {
                    error!(%err, %service, "failed to post service metrics to Mackerel");
                    match client.backup() {
                        Some(backup) => {
                            if let Err(err) =
                                backup.post_service_metric_values(service, buffer).await
                            {
                                error!(%err, %service, "failed to post service metrics to backup stream");
                            }
                        }
                        None => warn!(dropped = buffer.len(), %service, "dropping service metrics"),
                    }
                }
            }
            buffer.clear();
        }
    }
}

async fn post_otel_metric_worker(
    mut rx: Receiver<Metric>,
    oc: OtelConfig,
    api_key: String,
    policy: RetryPolicy,
) {
    use opentelemetry_sdk::metrics::exporter::PushMetricExporter;

    let exporter = match otel::new_exporter(&oc, &api_key) {
        Ok(exporter) => exporter,
        Err(err) => {
            error!(%err, "failed to create OpenTelemetry metric exporter");
            return;
        }
    };
    let endpoint = otel::endpoint_url(&oc);
    info!(%endpoint, "starting post otel metric worker");
    let resource = otel::resource_from(&oc.resource_attributes);

    let mut ticker = tokio::time::interval(POST_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffer: Vec<Metric> = Vec::with_capacity(POST_METRIC_BUFFER_LENGTH);
    let mut running = true;
    while running {
        tokio::select! {
            received = rx.recv() => match received {
                Some(m) => {
                    debug!(otel = %m.otel_string());
                    buffer.push(m);
                    if buffer.len() < POST_METRIC_BUFFER_LENGTH {
                        continue;
                    }
                }
                None => {
                    info!("shutting down post otel metric worker");
                    running = false;
                }
            },
            _ = ticker.tick() => {}
        }
        if buffer.is_empty() {
            continue;
        }
        debug!(count = buffer.len(), %endpoint, "posting otel metrics");
        let exported = do_retry(&policy, || {
            let mut rms = otel::build_resource_metrics(&resource, &buffer);
            let exporter = &exporter;
            async move { exporter.export(&mut rms).await }
        })
        .await;
        match exported {
            Ok(()) => debug!("post otel metrics succeeded"),
            Err(err) => error!(%err, "failed to export otel metrics"),
        }
        buffer.clear();
    }
    let _ = exporter.shutdown();
}

async fn dump_host_metric_worker(mut rx: Receiver<HostMetric>) {
    info!("starting dump host metric worker");
    while let Some(m) = rx.recv().await {
        let body = serde_json::to_string(&m.metric_value()).unwrap_or_default();
        info!(host_id = %m.host_id, "[host] {body}");
    }
}

async fn dump_service_metric_worker(mut rx: Receiver<ServiceMetric>) {
    info!("starting dump service metric worker");
    while let Some(m) = rx.recv().await {
        let body = serde_json::to_string(&m.metric_value()).unwrap_or_default();
        info!(service = %m.service, "[service] {body}");
    }
}

async fn dump_otel_metric_worker(mut rx: Receiver<Metric>) {
    info!("starting dump otel metric worker");
    while let Some(m) = rx.recv().await {
        info!("[otel] {}", m.otel_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DestinationConfig, ExString, MetricConfig, OutputConfig};
    use axum::extract::{Path, Query, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::future::IntoFuture;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorded {
        host_batches: Arc<Mutex<Vec<serde_json::Value>>>,
        service_batches: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        fail_posts: Arc<std::sync::atomic::AtomicBool>,
        post_attempts: Arc<std::sync::atomic::AtomicU32>,
    }

    async fn api_server(recorded: Recorded) -> Client {
        use std::sync::atomic::Ordering;

        let router = Router::new()
            .route(
                "/api/v0/tsdb",
                post(|State(r): State<Recorded>, Json(body): Json<serde_json::Value>| async move {
                    r.post_attempts.fetch_add(1, Ordering::SeqCst);
                    if r.fail_posts.load(Ordering::SeqCst) {
                        return Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    r.host_batches.lock().unwrap().push(body);
                    Ok(Json(serde_json::json!({"success": true})))
                }),
            )
            .route(
                "/api/v0/services/{service}/tsdb",
                post(
                    |State(r): State<Recorded>,
                     Path(service): Path<String>,
                     Json(body): Json<serde_json::Value>| async move {
                        r.post_attempts.fetch_add(1, Ordering::SeqCst);
                        if r.fail_posts.load(Ordering::SeqCst) {
                            return Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
                        }
                        r.service_batches.lock().unwrap().push((service, body));
                        Ok(Json(serde_json::json!({"success": true})))
                    },
                ),
            )
            .route(
                "/api/v0/hosts",
                get(|| async {
                    Json(serde_json::json!({"hosts": [
                        {"id": "agg-1", "name": "web01", "status": "working"},
                        {"id": "agg-2", "name": "web02", "status": "working"},
                    ]}))
                }),
            )
            .route(
                "/api/v0/hosts/{id}/metrics",
                get(
                    |Path(id): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                        let now = Utc::now().timestamp();
                        if q.get("name").map(String::as_str) == Some("custom.app.requests") {
                            let value = if id == "agg-1" { 2.0 } else { 3.0 };
                            Json(serde_json::json!({"metrics": [
                                {"time": now - 120, "value": 1.0},
                                {"time": now - 90, "value": value},
                            ]}))
                        } else {
                            Json(serde_json::json!({"metrics": []}))
                        }
                    },
                ),
            )
            .with_state(recorded);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        Client::new("test-key", "")
            .await
            .with_api_base(reqwest::Url::parse(&format!("http://{addr}")).unwrap())
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_count: 3,
        }
    }

    #[tokio::test]
    async fn host_poster_drains_on_close() {
        let recorded = Recorded::default();
        let client = api_server(recorded.clone()).await;
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        for i in 0..3 {
            tx.send(Metric::new(format!("test.metric.{i}"), i as f64).host_metric("h1"))
                .await
                .unwrap();
        }
        drop(tx);
        post_host_metric_worker(client, rx, fast_policy()).await;

        let batches = recorded.host_batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_array().unwrap().len(), 3);
        assert_eq!(batches[0][0]["hostId"], "h1");
    }

    #[tokio::test]
    async fn service_poster_drops_nan_and_groups_by_service() {
        let recorded = Recorded::default();
        let client = api_server(recorded.clone()).await;
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tx.send(Metric::new("app.ok", 1.0).service_metric("alpha"))
            .await
            .unwrap();
        tx.send(Metric::new("app.nan", f64::NAN).service_metric("alpha"))
            .await
            .unwrap();
        tx.send(Metric::new("app.ok", 2.0).service_metric("beta"))
            .await
            .unwrap();
        drop(tx);
        post_service_metric_worker(client, rx, fast_policy()).await;

        let batches = recorded.service_batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        for (service, body) in batches.iter() {
            let values = body.as_array().unwrap();
            assert_eq!(values.len(), 1, "NaN must not reach {service}");
        }
    }

    #[tokio::test]
    async fn poster_retries_then_drops_without_spill() {
        use std::sync::atomic::Ordering;

        let recorded = Recorded::default();
        recorded.fail_posts.store(true, Ordering::SeqCst);
        let client = api_server(recorded.clone()).await;
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tx.send(Metric::new("test.metric", 1.0).host_metric("h1"))
            .await
            .unwrap();
        drop(tx);
        post_host_metric_worker(client, rx, fast_policy()).await;

        // one flush, max_count attempts, nothing recorded
        assert_eq!(recorded.post_attempts.load(Ordering::SeqCst), 3);
        assert!(recorded.host_batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn aggregates_emit_summary_outputs() {
        let recorded = Recorded::default();
        let client = api_server(recorded).await;
        let (chs, mut rxs) = channels::new(&DestinationConfig::default());

        let ag = AggregateDefinition {
            service: "prod".into(),
            role: ExString::default(),
            roles: vec!["web".into()],
            statuses: vec![],
            metrics: vec![
                MetricConfig {
                    name: "custom.app.requests".into(),
                    outputs: vec![
                        OutputConfig {
                            func: "sum".into(),
                            name: "custom.app.sum_requests".into(),
                            emit_zero: false,
                            calc: Some(crate::calc::sum),
                        },
                        OutputConfig {
                            func: "avg".into(),
                            name: "custom.app.avg_requests".into(),
                            emit_zero: false,
                            calc: Some(crate::calc::avg),
                        },
                    ],
                },
                MetricConfig {
                    name: "custom.app.idle".into(),
                    outputs: vec![OutputConfig {
                        func: "sum".into(),
                        name: "custom.app.sum_idle".into(),
                        emit_zero: true,
                        calc: Some(crate::calc::sum),
                    }],
                },
            ],
        };

        run_aggregate_definition(ag, client, Arc::new(chs), Stats::none()).await;

        let mut emitted = HashMap::new();
        while let Ok(m) = rxs.aggregated_metrics.try_recv() {
            assert_eq!(m.service, "prod");
            emitted.insert(m.metric.name.clone(), m.metric.clone());
        }
        assert_eq!(emitted["custom.app.sum_requests"].value, 5.0);
        assert_eq!(emitted["custom.app.avg_requests"].value, 2.5);
        // both sides emitted the same (max) source timestamp
        assert_eq!(
            emitted["custom.app.sum_requests"].timestamp,
            emitted["custom.app.avg_requests"].timestamp
        );
        // no values + emit_zero: value 0 stamped one minute ago
        let zero = &emitted["custom.app.sum_idle"];
        assert_eq!(zero.value, 0.0);
        assert!(zero.timestamp <= Utc::now() - chrono::Duration::seconds(59));
    }

    #[tokio::test]
    async fn once_mode_runs_a_single_tick_and_exits() {
        let router = Router::new().route("/", get(|| async { "Hello HTTP Test" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());

        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
post_probed_metrics: false
probes:
  - service: prod
    service_metric: true
    http:
      url: "http://{addr}/"
      timeout: 2s
"#
        )
        .unwrap();
        f.flush().unwrap();

        let cancel = CancellationToken::new();
        run(
            cancel,
            f.path().to_str().unwrap(),
            true,
            "",
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    }
}
