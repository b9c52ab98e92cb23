//! Typed fan-out queues between probe producers and the upstream
//! posters.
//!
//! Four bounded queues are always allocated; the send helpers gate
//! pushes on destination enablement, so a disabled destination's queue
//! exists but stays empty. Dropping [`Channels`] closes every queue,
//! which is how the run loop tells the posters to drain and exit.

use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::config::DestinationConfig;
use crate::metric::{HostMetric, Metric, ServiceMetric};
use crate::POST_METRIC_BUFFER_LENGTH;

pub struct Channels {
    host_tx: Sender<HostMetric>,
    service_tx: Sender<ServiceMetric>,
    aggregated_tx: Sender<ServiceMetric>,
    otel_tx: Sender<Metric>,
    destination: DestinationConfig,
}

pub struct Receivers {
    pub host_metrics: Receiver<HostMetric>,
    pub service_metrics: Receiver<ServiceMetric>,
    pub aggregated_metrics: Receiver<ServiceMetric>,
    pub otel_metrics: Receiver<Metric>,
}

pub fn new(destination: &DestinationConfig) -> (Channels, Receivers) {
    let capacity = POST_METRIC_BUFFER_LENGTH * 10;
    let (host_tx, host_rx) = channel(capacity);
    let (service_tx, service_rx) = channel(capacity);
    let (aggregated_tx, aggregated_rx) = channel(capacity);
    let (otel_tx, otel_rx) = channel(capacity);
    (
        Channels {
            host_tx,
            service_tx,
            aggregated_tx,
            otel_tx,
            destination: destination.clone(),
        },
        Receivers {
            host_metrics: host_rx,
            service_metrics: service_rx,
            aggregated_metrics: aggregated_rx,
            otel_metrics: otel_rx,
        },
    )
}

impl Channels {
    pub async fn send_host_metric(&self, m: HostMetric) {
        if self.destination.mackerel.enabled {
            let _ = self.host_tx.send(m.clone()).await;
        }
        if self.destination.otel.enabled {
            let _ = self.otel_tx.send(m.metric).await;
        }
    }

    pub async fn send_service_metric(&self, m: ServiceMetric) {
        if self.destination.mackerel.enabled {
            let _ = self.service_tx.send(m.clone()).await;
        }
        if self.destination.otel.enabled {
            let _ = self.otel_tx.send(m.metric).await;
        }
    }

    pub async fn send_aggregated_metric(&self, m: ServiceMetric) {
        if self.destination.mackerel.enabled {
            let _ = self.aggregated_tx.send(m).await;
        }
        // TODO: forward aggregated metrics to the OTel queue as well
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MackerelConfig, OtelConfig};

    fn destination(mackerel: bool, otel: bool) -> DestinationConfig {
        DestinationConfig {
            mackerel: MackerelConfig { enabled: mackerel },
            otel: OtelConfig {
                enabled: otel,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn sends_follow_destination_enablement() {
        let (chs, mut rxs) = new(&destination(true, true));
        chs.send_host_metric(Metric::new("ping.check.ok", 1.0).host_metric("h1"))
            .await;
        chs.send_service_metric(Metric::new("http.check.ok", 1.0).service_metric("svc"))
            .await;

        assert_eq!(rxs.host_metrics.recv().await.unwrap().host_id, "h1");
        assert_eq!(rxs.service_metrics.recv().await.unwrap().service, "svc");
        // both sends were mirrored onto the otel queue
        assert!(rxs.otel_metrics.recv().await.is_some());
        assert!(rxs.otel_metrics.recv().await.is_some());
    }

    #[tokio::test]
    async fn disabled_otel_queue_stays_empty() {
        let (chs, mut rxs) = new(&destination(true, false));
        chs.send_host_metric(Metric::new("ping.check.ok", 1.0).host_metric("h1"))
            .await;
        drop(chs);
        assert!(rxs.host_metrics.recv().await.is_some());
        assert!(rxs.otel_metrics.recv().await.is_none());
    }

    #[tokio::test]
    async fn aggregated_metrics_stay_off_the_otel_queue() {
        let (chs, mut rxs) = new(&destination(true, true));
        chs.send_aggregated_metric(Metric::new("custom.sum", 3.0).service_metric("svc"))
            .await;
        drop(chs);
        assert_eq!(rxs.aggregated_metrics.recv().await.unwrap().service, "svc");
        assert!(rxs.otel_metrics.recv().await.is_none());
    }
}
