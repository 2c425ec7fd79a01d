//! Standalone syncbridge relay service
//!
//! Serves the WebSocket message bus and the HTTP side channel on one
//! listener and runs until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use syncbridge_relay::{spawn, RelayConfig};

#[derive(Debug, Parser)]
#[command(name = "syncbridge-relay", about = "Syncbridge rendezvous and relay server", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// Directory for store-and-forward uploads
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = RelayConfig::default();
    if let Some(store_dir) = args.store_dir {
        config.store_dir = store_dir;
    }

    let (addr, _state, server) = spawn(args.listen, config).await?;
    info!("Relay up on {}", addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
        result = server => {
            result?;
        }
    }

    Ok(())
}
