//! CLI entry point for the bridge.
//!
//! ```bash
//! # Run the bridge with a config file
//! bluesky-bridge --config bridge.toml run
//!
//! # Standalone relay broker for `relay.mode = "remote"`
//! bluesky-bridge broker --publish-port 5579 --subscribe-port 5580
//!
//! # Replay a recorded document stream and summarize the scans
//! bluesky-bridge -v ingest documents.jsonl
//! ```

use anyhow::{Context, Result};
use bluesky_bridge::bridge_core::Document;
use bluesky_bridge::config::BridgeConfig;
use bluesky_bridge::context::{open_store, BridgeContext};
use bluesky_bridge::logging::{self, TracingConfig};
use bluesky_bridge::pipeline::BridgeService;
use bluesky_bridge::relay::{BrokerServer, RelayBroker};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bluesky-bridge", version)]
#[command(about = "Bridge Bluesky run engine documents into a replayable scan store", long_about = None)]
struct Cli {
    /// Config file (TOML, or YAML by extension)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge service
    Run {
        /// Document listener host
        #[arg(long)]
        host: Option<String>,

        /// Document listener port
        #[arg(long)]
        port: Option<u16>,

        /// Retrieval listener port
        #[arg(long)]
        retrieval_port: Option<u16>,
    },

    /// Run a standalone relay broker
    Broker {
        /// Bind host
        #[arg(long)]
        host: Option<String>,

        /// Port the bridge publishes to
        #[arg(long)]
        publish_port: Option<u16>,

        /// Port subscribers attach to
        #[arg(long)]
        subscribe_port: Option<u16>,
    },

    /// Replay a JSON-lines document file and print a summary per scan
    Ingest {
        /// File with one `{"name": .., "doc": ..}` document per line
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = BridgeConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_verbosity(cli.verbose);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            host,
            port,
            retrieval_port,
        } => {
            if let Some(host) = host {
                config.ingest.host = host;
            }
            if let Some(port) = port {
                config.ingest.port = port;
            }
            if let Some(port) = retrieval_port {
                config.retrieval.port = port;
            }
            BridgeContext::build(config)?.serve().await
        }
        Commands::Broker {
            host,
            publish_port,
            subscribe_port,
        } => {
            if let Some(host) = host {
                config.relay.broker_host = host;
            }
            if let Some(port) = publish_port {
                config.relay.publish_port = port;
            }
            if let Some(port) = subscribe_port {
                config.relay.subscribe_port = port;
            }
            run_broker(config).await
        }
        Commands::Ingest { file } => ingest_file(config, file).await,
    }
}

async fn run_broker(config: BridgeConfig) -> Result<()> {
    let relay = &config.relay;
    let publish_addr = format!("{}:{}", relay.broker_host, relay.publish_port);
    let subscribe_addr = format!("{}:{}", relay.broker_host, relay.subscribe_port);
    let publish = TcpListener::bind(&publish_addr)
        .await
        .with_context(|| format!("binding publish port {}", publish_addr))?;
    let subscribe = TcpListener::bind(&subscribe_addr)
        .await
        .with_context(|| format!("binding subscribe port {}", subscribe_addr))?;

    let broker = RelayBroker::new(relay.subscriber_queue_capacity);
    let server = BrokerServer::new(broker.clone());
    let cancel = CancellationToken::new();
    let publishers = tokio::spawn(server.clone().serve_publishers(publish, cancel.clone()));
    let subscribers = tokio::spawn(server.serve_subscribers(subscribe, cancel.clone()));
    info!(publish = %publish_addr, subscribe = %subscribe_addr, "Relay broker running");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    cancel.cancel();
    broker.close();
    let _ = tokio::join!(publishers, subscribers);
    info!(published = broker.published(), "Relay broker stopped");
    Ok(())
}

async fn ingest_file(config: BridgeConfig, file: PathBuf) -> Result<()> {
    let store = open_store(&config.storage)?;
    let service = BridgeService::spawn(
        store.clone(),
        config.scan.clone(),
        config.ingest.queue_capacity,
        config.ingest.scan_queue_capacity,
    );
    let handle = service.handle();

    let input = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match Document::from_json(&line) {
            Ok(document) => handle.submit(document).await?,
            Err(e) => {
                handle.stats_handle().record_rejected();
                warn!(line = line_no, error = %e, "Skipping undecodable document");
            }
        }
    }
    handle.drain().await?;
    let stats = handle.stats();
    drop(handle);
    service.shutdown().await;
    let flush_store = store.clone();
    tokio::task::spawn_blocking(move || flush_store.flush_all())
        .await
        .context("flush task panicked")??;

    println!(
        "{} documents applied, {} rejected, {} samples",
        stats.documents, stats.rejected, stats.samples
    );
    for scan in store.scans() {
        let info = scan.info();
        println!("{} #{} {} [{:?}]", scan.run_id(), info.scan_nb, info.name, scan.state());
        for channel in scan.channels() {
            let progress = channel.progress();
            println!(
                "    {:<24} {:<16} {} samples",
                channel.schema().name,
                channel.schema().describe(),
                progress.written
            );
        }
    }
    Ok(())
}
