//! Internal self-observation published over the OTel pipeline.
//!
//! When the OTel destination is enabled the collector registers a
//! meter carrying the configured `stats_attributes` and publishes
//! gauges for the configured/discovered target counts plus counters
//! for produced samples, probe executions and log records.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, MeterProvider as _, ObservableGauge};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::runtime::Tokio;
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::config::OtelConfig;
use crate::otel;

static GLOBAL_STATS: OnceCell<Arc<StatsCollector>> = OnceCell::new();

pub struct StatsCollector {
    provider: SdkMeterProvider,
    metrics_collected: Counter<u64>,
    probe_executions: Counter<u64>,
    messages: Counter<u64>,

    probe_configs: Arc<AtomicI64>,
    target_hosts: Arc<AtomicI64>,
    target_services: Arc<AtomicI64>,

    // callbacks stay registered for the collector's lifetime
    _gauges: Vec<ObservableGauge<i64>>,
}

impl StatsCollector {
    pub fn new(oc: &OtelConfig, api_key: &str) -> anyhow::Result<Arc<Self>> {
        let exporter = otel::new_exporter(oc, api_key)?;
        let reader = PeriodicReader::builder(exporter, Tokio).build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(otel::resource_from(&oc.resource_attributes))
            .build();

        let scope = InstrumentationScope::builder("mkrprobe/stats")
            .with_attributes(
                oc.stats_attributes
                    .iter()
                    .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                    .collect::<Vec<_>>(),
            )
            .build();
        let meter = provider.meter_with_scope(scope);

        let probe_configs = Arc::new(AtomicI64::new(0));
        let target_hosts = Arc::new(AtomicI64::new(0));
        let target_services = Arc::new(AtomicI64::new(0));

        let mut gauges = Vec::with_capacity(3);
        for (name, description, value) in [
            ("mkrprobe_probe_configs", "Number of configured probes", &probe_configs),
            ("mkrprobe_target_hosts", "Number of target hosts", &target_hosts),
            ("mkrprobe_target_services", "Number of target services", &target_services),
        ] {
            let value = Arc::clone(value);
            gauges.push(
                meter
                    .i64_observable_gauge(name)
                    .with_description(description)
                    .with_callback(move |observer| {
                        observer.observe(value.load(Ordering::Relaxed), &[])
                    })
                    .build(),
            );
        }

        let metrics_collected = meter
            .u64_counter("mkrprobe_metrics_collected_total")
            .with_description("Total number of metrics collected")
            .build();
        let probe_executions = meter
            .u64_counter("mkrprobe_probe_executions_total")
            .with_description("Total number of probe executions")
            .build();
        let messages = meter
            .u64_counter("mkrprobe_messages")
            .with_description("Total number of log records by level")
            .build();

        Ok(Arc::new(Self {
            provider,
            metrics_collected,
            probe_executions,
            messages,
            probe_configs,
            target_hosts,
            target_services,
            _gauges: gauges,
        }))
    }

    fn set_probe_configs(&self, count: i64) {
        self.probe_configs.store(count, Ordering::Relaxed);
    }

    fn set_target_counts(&self, hosts: i64, services: i64) {
        self.target_hosts.store(hosts, Ordering::Relaxed);
        self.target_services.store(services, Ordering::Relaxed);
    }

    fn record_probe_execution(&self, probe_type: &'static str, ok: bool) {
        let status = if ok { "success" } else { "error" };
        self.probe_executions.add(
            1,
            &[
                KeyValue::new("status", status),
                KeyValue::new("probe_type", probe_type),
            ],
        );
    }

    fn record_metric_collected(&self) {
        self.metrics_collected.add(1, &[]);
    }

    fn record_log_message(&self, level: &'static str) {
        self.messages.add(1, &[KeyValue::new("level", level)]);
    }

    fn shutdown(&self) {
        let _ = self.provider.shutdown();
    }
}

/// Handle used throughout the agent; a no-op when OTel is disabled.
#[derive(Clone, Default)]
pub struct Stats(Option<Arc<StatsCollector>>);

impl Stats {
    /// Build the collector when the destination enables OTel, and make
    /// it visible to the log-counting layer.
    pub fn new(oc: &OtelConfig, api_key: &str) -> anyhow::Result<Self> {
        if !oc.enabled {
            return Ok(Self(None));
        }
        let collector = StatsCollector::new(oc, api_key)?;
        let _ = GLOBAL_STATS.set(Arc::clone(&collector));
        Ok(Self(Some(collector)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn set_probe_configs(&self, count: i64) {
        if let Some(s) = &self.0 {
            s.set_probe_configs(count);
        }
    }

    pub fn set_target_counts(&self, hosts: i64, services: i64) {
        if let Some(s) = &self.0 {
            s.set_target_counts(hosts, services);
        }
    }

    pub fn record_probe_execution(&self, probe_type: &'static str, ok: bool) {
        if let Some(s) = &self.0 {
            s.record_probe_execution(probe_type, ok);
        }
    }

    pub fn record_metric_collected(&self) {
        if let Some(s) = &self.0 {
            s.record_metric_collected();
        }
    }

    pub fn shutdown(&self) {
        if let Some(s) = &self.0 {
            s.shutdown();
        }
    }
}

/// Subscriber layer counting every log record at/above the threshold
/// into the `mkrprobe_messages` counter. Inert until the collector is
/// installed.
#[derive(Clone, Default)]
pub struct MetricsLayer;

impl<S: Subscriber> Layer<S> for MetricsLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if let Some(stats) = GLOBAL_STATS.get() {
            stats.record_log_message(event.metadata().level().as_str());
        }
    }
}
