//! mkrprobe CLI: the long-running agent plus standalone single-shot
//! probe invocations.

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mkrprobe::client::{Client, Host};
use mkrprobe::probe::{
    GrpcProbeConfig, HttpProbeConfig, PingProbeConfig, Probe, TcpProbeConfig,
};
use mkrprobe::{agent, firehose, stats, DEFAULT_PROBE_INTERVAL};

#[derive(Parser)]
#[command(name = "mkrprobe", version, about = "Synthetic monitoring agent for Mackerel")]
struct Cli {
    /// Log level (trace|debug|info|warn|error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
    /// Log format
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent
    Agent {
        /// Configuration file path or URL (http|s3)
        #[arg(short = 'c', long, env = "CONFIG")]
        config: String,
        /// Also serve the spill re-ingest HTTP endpoint
        #[arg(long)]
        with_firehose_endpoint: bool,
        /// Re-ingest endpoint listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run all probes once and exit
    Once {
        #[arg(short = 'c', long, env = "CONFIG")]
        config: String,
    },
    /// Run a ping probe
    Ping {
        /// Hostname or IP address
        address: String,
        /// Iteration count
        #[arg(short = 'c', long)]
        count: Option<u32>,
        /// Timeout waiting for an echo reply
        #[arg(short = 't', long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        /// Mackerel host ID
        #[arg(short = 'i', long)]
        host_id: Option<String>,
    },
    /// Run a TCP probe
    Tcp {
        /// Hostname or IP address
        host: String,
        /// Port number
        port: String,
        /// String to send to the server
        #[arg(short = 's', long)]
        send: Option<String>,
        /// String initiating a clean close of the connection
        #[arg(short = 'q', long)]
        quit: Option<String>,
        #[arg(short = 't', long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        /// Regexp pattern to expect in the server response
        #[arg(short = 'e', long = "expect")]
        expect_pattern: Option<String>,
        /// Do not check the certificate
        #[arg(short = 'k', long)]
        no_check_certificate: bool,
        /// Use TLS
        #[arg(long)]
        tls: bool,
        #[arg(short = 'i', long)]
        host_id: Option<String>,
    },
    /// Run an HTTP probe
    Http {
        url: String,
        /// Request method
        #[arg(short = 'm', long, default_value = "GET")]
        method: String,
        /// Request body
        #[arg(short = 'b', long)]
        body: Option<String>,
        /// Regexp pattern to expect in the response body
        #[arg(short = 'e', long = "expect")]
        expect_pattern: Option<String>,
        #[arg(short = 't', long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        #[arg(short = 'k', long)]
        no_check_certificate: bool,
        /// Request headers ("Name: Value", repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(short = 'i', long)]
        host_id: Option<String>,
    },
    /// Run a gRPC health probe
    Grpc {
        /// Server address (host:port)
        address: String,
        /// gRPC service name for the health check
        #[arg(short = 's', long = "service")]
        grpc_service: Option<String>,
        #[arg(short = 't', long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        #[arg(short = 'k', long)]
        no_check_certificate: bool,
        #[arg(long)]
        tls: bool,
        /// Outgoing metadata ("key:value", repeatable)
        #[arg(short = 'm', long = "metadata")]
        metadata: Vec<String>,
        #[arg(short = 'i', long)]
        host_id: Option<String>,
    },
    /// Run the spill re-ingest endpoint
    FirehoseEndpoint {
        #[arg(short = 'p', long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let api_key = std::env::var("MACKEREL_APIKEY").unwrap_or_default();
    let cancel = CancellationToken::new();
    if let Err(err) = spawn_signal_handler(cancel.clone()) {
        error!(%err, "failed to install signal handlers");
        std::process::exit(1);
    }

    let result = dispatch(cli.command, cancel.clone(), &api_key).await;
    info!("shutdown");
    if cancel.is_cancelled() {
        return;
    }
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(stats::MetricsLayer);
    match cli.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// SIGHUP/SIGINT/SIGTERM/SIGQUIT cancel the run context; a second
/// signal force-exits with status 2.
fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::spawn(async move {
        let mut count = 0;
        loop {
            tokio::select! {
                _ = hangup.recv() => {}
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
                _ = quit.recv() => {}
            }
            count += 1;
            info!("signal received, shutting down");
            if count >= 2 {
                std::process::exit(2);
            }
            cancel.cancel();
        }
    });
    Ok(())
}

async fn dispatch(command: Command, cancel: CancellationToken, api_key: &str) -> anyhow::Result<()> {
    match command {
        Command::Agent {
            config,
            with_firehose_endpoint,
            port,
        } => {
            let endpoint = with_firehose_endpoint.then(|| {
                tokio::spawn(firehose::run_endpoint(
                    cancel.clone(),
                    port,
                    api_key.to_string(),
                ))
            });
            let result = agent::run(cancel.clone(), &config, false, api_key, DEFAULT_PROBE_INTERVAL).await;
            cancel.cancel();
            if let Some(handle) = endpoint {
                let _ = handle.await;
            }
            result
        }
        Command::Once { config } => {
            agent::run(cancel, &config, true, api_key, DEFAULT_PROBE_INTERVAL).await
        }
        Command::Ping {
            address,
            count,
            timeout,
            host_id,
        } => {
            let host = resolve_host(api_key, host_id).await?;
            let pc = PingProbeConfig {
                address,
                count,
                timeout,
                metric_key_prefix: None,
            };
            run_single(Probe::Ping(pc.generate_probe(&host)?), &cancel).await
        }
        Command::Tcp {
            host,
            port,
            send,
            quit,
            timeout,
            expect_pattern,
            no_check_certificate,
            tls,
            host_id,
        } => {
            let target = resolve_host(api_key, host_id).await?;
            let pc = TcpProbeConfig {
                host,
                port,
                timeout,
                send: send.unwrap_or_default(),
                quit: quit.unwrap_or_default(),
                expect_pattern: expect_pattern.unwrap_or_default(),
                tls,
                no_check_certificate,
                ..Default::default()
            };
            run_single(Probe::Tcp(pc.generate_probe(&target)?), &cancel).await
        }
        Command::Http {
            url,
            method,
            body,
            expect_pattern,
            timeout,
            no_check_certificate,
            headers,
            host_id,
        } => {
            let host = resolve_host(api_key, host_id).await?;
            let pc = HttpProbeConfig {
                url,
                method: Some(method),
                headers: parse_pairs(&headers, ':')?,
                body: body.unwrap_or_default(),
                expect_pattern: expect_pattern.unwrap_or_default(),
                timeout,
                no_check_certificate,
                metric_key_prefix: None,
            };
            run_single(Probe::Http(pc.generate_probe(&host)?), &cancel).await
        }
        Command::Grpc {
            address,
            grpc_service,
            timeout,
            no_check_certificate,
            tls,
            metadata,
            host_id,
        } => {
            let host = resolve_host(api_key, host_id).await?;
            let pc = GrpcProbeConfig {
                address,
                grpc_service: grpc_service.unwrap_or_default(),
                timeout,
                tls,
                no_check_certificate,
                metadata: parse_pairs(&metadata, ':')?,
                metric_key_prefix: None,
            };
            run_single(Probe::Grpc(pc.generate_probe(&host)?), &cancel).await
        }
        Command::FirehoseEndpoint { port } => {
            firehose::run_endpoint(cancel, port, api_key.to_string()).await
        }
    }
}

async fn resolve_host(api_key: &str, host_id: Option<String>) -> anyhow::Result<Host> {
    if let Some(id) = host_id.filter(|id| !id.is_empty()) {
        if !api_key.is_empty() {
            debug!(host_id = %id, "finding host");
            return Ok(Client::new(api_key, "").await.find_host(&id).await?);
        }
    }
    debug!("using dummy host");
    Ok(Host {
        id: "dummy".to_string(),
        ..Default::default()
    })
}

async fn run_single(probe: Probe, cancel: &CancellationToken) -> anyhow::Result<()> {
    let result = probe.run(cancel).await;
    for m in &result.metrics {
        println!("{m}");
    }
    match result.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn parse_pairs(
    raw: &[String],
    separator: char,
) -> anyhow::Result<std::collections::HashMap<String, String>> {
    let mut pairs = std::collections::HashMap::with_capacity(raw.len());
    for entry in raw {
        let (name, value) = entry
            .split_once(separator)
            .ok_or_else(|| anyhow::anyhow!("invalid pair {entry:?}, expected name{separator}value"))?;
        pairs.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(pairs)
}
