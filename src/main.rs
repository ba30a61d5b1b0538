use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use mainline_dht::{DhtConfig, DhtEvent, InfoHash, MainlineDht, NodeFile, NodeId};

fn parse_info_hash(s: &str) -> Result<InfoHash> {
    NodeId::from_hex(s).context("info hash must be 40 hex characters")
}

#[derive(Parser, Debug)]
#[command(name = "mainline-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// File holding nodes saved by a previous run.
    #[arg(short, long, default_value = "dht-nodes.dat")]
    nodes: PathBuf,

    /// Skip bootstrap and start with an empty routing table.
    #[arg(long)]
    no_bootstrap: bool,

    /// Bootstrap router, HOST:PORT. Replaces the built-in list when given.
    #[arg(short = 'R', long = "router", value_name = "HOST:PORT")]
    routers: Vec<String>,

    /// Look up peers for this info hash once bootstrapped.
    #[arg(short, long, value_name = "HEX", value_parser = parse_info_hash)]
    get_peers: Option<InfoHash>,

    /// Announce this info hash once bootstrapped.
    #[arg(short, long, value_name = "HEX", value_parser = parse_info_hash)]
    announce: Option<InfoHash>,

    /// Port to announce; 0 announces the DHT socket's port.
    #[arg(short, long, default_value = "0")]
    port: u16,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = DhtConfig {
        bootstrap: !args.no_bootstrap,
        ..DhtConfig::default()
    };
    if !args.routers.is_empty() {
        config.bootstrap_hosts = args.routers.clone();
    }

    let dht = MainlineDht::bind(args.bind, config).await?;
    info!("DHT node id: {}", dht.id());

    let store = NodeFile::new(&args.nodes);
    let summary = dht.start_from(&store).await?.wait().await?;
    info!(
        nodes = summary.nodes,
        attempts = summary.attempts,
        used_routers = summary.used_routers,
        "bootstrap finished"
    );

    let mut events = dht.subscribe();

    if let Some(info_hash) = args.get_peers {
        let lookup = dht.get_peers(info_hash.as_bytes())?.wait().await?;
        info!(
            info_hash = %info_hash,
            peers = lookup.peers.len(),
            queried = lookup.queried,
            "get_peers finished"
        );
        for peer in &lookup.peers {
            info!("peer {peer}");
        }
    }

    if let Some(info_hash) = args.announce {
        let announce = dht.announce(info_hash.as_bytes(), args.port)?.wait().await?;
        info!(
            info_hash = %info_hash,
            announced_to = announce.announced_to,
            "announce finished"
        );
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Save known nodes and stop on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, saving nodes");
                break;
            }
            _ = interval.tick() => {
                info!(
                    state = ?dht.state(),
                    nodes = dht.node_count().await,
                    "status"
                );
            }
            event = events.recv() => {
                if let Ok(DhtEvent::PeerAnnounced { info_hash, peer }) = event {
                    info!(info_hash = %info_hash, peer = %peer, "peer announced to us");
                }
            }
        }
    }

    if let Err(e) = dht.save_to(&store).await {
        warn!(error = %e, "failed to save nodes");
    }
    dht.shutdown().await;
    Ok(())
}
