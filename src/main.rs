//! `netsuite-core` CLI — a thin binary exercising the port scanner, ping
//! engine, and TCP broker directly from the command line.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use netsuite_core::broker::{BrokerClient, BrokerServer, BrokerServerConfig, ConnectionConfig};
use netsuite_core::ping::{PingEngine, PingEngineConfig};
use netsuite_core::ports::{default_ports, parse_port_spec};
use netsuite_core::scanner::{PortScanner, ScannerConfig};
use netsuite_core::types::{BrokerMessage, MessageType, Protocol};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "netsuite-core", version, about = "Network-diagnostic engines: scan, ping, broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan one or more hosts for open TCP ports.
    Scan {
        /// Comma-separated hosts or IPs.
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,

        /// Port spec, e.g. "22,80,8000-8010"; defaults to a common-ports list.
        #[arg(long)]
        ports: Option<String>,

        #[arg(long, default_value_t = 100)]
        concurrency: usize,

        #[arg(long = "timeout-ms", default_value_t = 3000)]
        timeout_ms: u64,

        #[arg(long)]
        service_detection: bool,

        #[arg(long)]
        banner: bool,
    },

    /// Ping a single host a fixed number of times.
    Ping {
        host: String,

        #[arg(long, default_value_t = 4)]
        count: u32,

        #[arg(long = "timeout-ms", default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Run a broker server until interrupted.
    BrokerServe {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 9700)]
        port: u16,
    },

    /// Connect to a broker server and send one chat message.
    BrokerSend {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long)]
        port: u16,

        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Scan {
            targets,
            ports,
            concurrency,
            timeout_ms,
            service_detection,
            banner,
        } => run_scan(targets, ports, concurrency, timeout_ms, service_detection, banner).await,
        Command::Ping { host, count, timeout_ms } => run_ping(host, count, timeout_ms).await,
        Command::BrokerServe { host, port } => run_broker_serve(host, port).await,
        Command::BrokerSend { host, port, message } => run_broker_send(host, port, message).await,
    }
}

async fn run_scan(
    targets: Vec<String>,
    ports_spec: Option<String>,
    concurrency: usize,
    timeout_ms: u64,
    service_detection: bool,
    banner: bool,
) -> Result<()> {
    let ports = match ports_spec {
        Some(spec) => parse_port_spec(&spec)?,
        None => default_ports(),
    };

    let scanner = PortScanner::new(ScannerConfig {
        max_concurrent: concurrency,
        timeout: Duration::from_millis(timeout_ms),
        service_detection,
        banner_grabbing: banner,
        ..ScannerConfig::default()
    });

    let results = scanner
        .scan_batch(&targets, &ports, Protocol::Tcp, CancellationToken::new(), None)
        .await;

    for result in results.into_iter().filter(|r| r.status == netsuite_core::types::ScanStatus::Open) {
        println!(
            "{}:{} open{}{}",
            result.host,
            result.port,
            result.service_name.map(|s| format!(" ({s})")).unwrap_or_default(),
            result.response_time_ms.map(|ms| format!(" {ms:.1}ms")).unwrap_or_default(),
        );
    }

    Ok(())
}

async fn run_ping(host: String, count: u32, timeout_ms: u64) -> Result<()> {
    let engine = PingEngine::new(PingEngineConfig {
        timeout: Duration::from_millis(timeout_ms),
        ..PingEngineConfig::default()
    });

    let samples = engine.ping_host(&host, Some(count), None).await;
    for sample in &samples {
        if sample.success {
            println!(
                "seq={} time={:.2}ms ttl={}",
                sample.sequence,
                sample.response_time_ms.unwrap_or(0.0),
                sample.ttl.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string()),
            );
        } else {
            println!("seq={} failed: {:?}", sample.sequence, sample.error_message);
        }
    }

    let stats = netsuite_core::ping::calculate_statistics(&samples, samples.len() as f64);
    let quality = netsuite_core::ping::assess_connection_quality(&stats);
    println!(
        "--- {} ping statistics: {:.1}% loss, avg {:.2}ms, quality {:?} ({:.0}/100)",
        host, stats.packet_loss_pct, stats.avg_ms, quality.rating, quality.score
    );

    Ok(())
}

async fn run_broker_serve(host: String, port: u16) -> Result<()> {
    let server = BrokerServer::new(BrokerServerConfig {
        host,
        port,
        ..BrokerServerConfig::default()
    });
    let actual_port = server.serve().await?;
    println!("broker listening on port {actual_port}");

    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}

async fn run_broker_send(host: String, port: u16, message: String) -> Result<()> {
    let client = BrokerClient::new(ConnectionConfig {
        server_host: host,
        server_port: port,
        ..ConnectionConfig::default()
    });
    client.connect().await?;
    client.send(BrokerMessage::new(MessageType::Broadcast, message)).await?;
    println!("message sent");
    Ok(())
}
