//! ibsschat — gossip-with-acknowledgement chat daemon for ad-hoc networks.
//!
//! Thin CLI front-end over the `Engine` library: argument parsing, logging
//! init, and process lifecycle. The Wi-Fi interface configuration, firmware
//! probing, and interactive client prompt are external collaborators and
//! live outside this binary.

use clap::Parser;
use ibsschat::{EngineConfig, Engine};
use std::net::Ipv4Addr;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ibsschat", version, about = "Ad-hoc IBSS gossip chat daemon")]
struct Args {
    /// This node's interface IPv4 address (the link is assumed already up).
    #[arg(long)]
    ip: Ipv4Addr,

    /// Pre-shared key, hex-encoded (1..=60 bytes decoded).
    #[arg(long)]
    key: String,

    /// Override the multicast group port (default: the reserved constant).
    #[arg(long)]
    group_port: Option<u16>,

    /// Override the local send port (default: the reserved constant).
    #[arg(long)]
    send_port: Option<u16>,

    /// Override the local recv/sync port (default: the reserved constant).
    #[arg(long)]
    recv_port: Option<u16>,

    /// `tracing-subscriber` EnvFilter override.
    #[arg(long, default_value = "ibsschat=info")]
    log_filter: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_filter.clone())),
        )
        .init();

    let key = match hex::decode(&args.key) {
        Ok(k) => k,
        Err(e) => {
            error!("invalid --key hex encoding: {e}");
            return;
        }
    };

    let mut config = EngineConfig::new(args.ip, key);
    if let Some(port) = args.group_port {
        config.group_port = port;
    }
    if let Some(port) = args.send_port {
        config.send_port = port;
    }
    if let Some(port) = args.recv_port {
        config.recv_port = port;
    }

    let mut engine = match Engine::new(config) {
        Ok(e) => e,
        Err(e) => {
            error!("failed to construct engine: {e}");
            return;
        }
    };

    if let Err(e) = engine.start().await {
        error!("failed to start engine: {e}");
        return;
    }

    info!("ibsschat running on {}. Waiting for peers...", args.ip);

    let peers = engine.peers().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            info!("status: {} known peers", peers.len());
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    engine.stop().await;
}
