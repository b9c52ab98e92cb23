//! mkrprobe - synthetic monitoring agent for Mackerel.
//!
//! Discovers target hosts via the Mackerel API, runs active probes
//! (ICMP, TCP, HTTP, gRPC health, plugin command) against them on a
//! fixed interval, and ships the resulting metrics to Mackerel and/or
//! an OpenTelemetry endpoint, spilling to a Firehose stream when the
//! primary sink is unreachable.

pub mod agent;
pub mod calc;
pub mod channels;
pub mod client;
pub mod config;
pub mod firehose;
pub mod metric;
pub mod otel;
pub mod probe;
pub mod stats;
pub mod template;

use std::time::Duration;

/// Upper bound on concurrently running probes across all definitions.
pub const MAX_CONCURRENCY: usize = 100;

/// Upper bound on concurrent requests against the Mackerel API issued
/// by the latest-metric fetcher.
pub const MAX_CLIENT_CONCURRENCY: usize = 5;

/// Poster buffers flush when they reach this many samples. The fan-out
/// channels are sized at ten times this value.
pub const POST_METRIC_BUFFER_LENGTH: usize = 100;

/// Interval between probe ticks.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Latest-metric samples older than this are discarded by the
/// aggregation engine.
pub const METRIC_TIME_MARGIN: Duration = Duration::from_secs(3 * 60);
