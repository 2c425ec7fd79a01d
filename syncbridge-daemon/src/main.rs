//! Syncbridge daemon
//!
//! Wires the protocol components together: relay link, peer registry,
//! transport manager and transfer engine. `run` keeps the device announced
//! and receiving until interrupted; `send` pushes one file to a peer and
//! exits.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use syncbridge_protocol::{
    ChannelEvent, DeviceIdentity, NegotiatorConfig, PeerEvent, PeerRegistry, RelayLink,
    StaticIdentity, TransferEngine, TransferEvent, TransportManager,
};

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "syncbridge-daemon", about = "Syncbridge sync daemon", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Relay endpoint(s), primary first; overrides the config file
    #[arg(long)]
    relay: Vec<String>,

    /// Device name shown to peers; overrides the config file
    #[arg(long)]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon until interrupted
    Run,

    /// Send one file to a peer and exit
    Send {
        /// Target device id
        peer: String,

        /// File to send
        file: PathBuf,

        /// Try to negotiate a direct channel before sending
        #[arg(long)]
        direct: bool,
    },
}

/// Everything a subcommand needs, wired and started.
struct Node {
    registry: Arc<PeerRegistry>,
    manager: Arc<TransportManager>,
    engine: Arc<TransferEngine<TransportManager>>,
}

fn load_config(cli: &Cli) -> Result<(Config, PathBuf)> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let mut config = Config::load(&path)?;

    if !cli.relay.is_empty() {
        config.relay.urls = cli.relay.clone();
    }
    if let Some(name) = &cli.name {
        config.device.name = name.clone();
    }
    Ok((config, path))
}

fn resolve_identity(config: &mut Config, path: &PathBuf) -> StaticIdentity {
    match &config.device.device_id {
        Some(id) => StaticIdentity::new(id.clone(), config.device.name.clone()),
        None => {
            let identity = StaticIdentity::generate(config.device.name.clone());
            config.device.device_id = Some(identity.device_id().to_string());
            if let Err(e) = config.save(path) {
                warn!("Could not persist generated device id: {}", e);
            }
            identity
        }
    }
}

fn start_node(config: &Config, identity: &StaticIdentity) -> Result<Node> {
    if config.relay.urls.is_empty() {
        bail!("no relay endpoint configured");
    }

    let relay = RelayLink::new(
        config.relay.urls.clone(),
        identity,
        config.relay_link_config(),
    );
    relay.start();

    let manager = TransportManager::new(Arc::clone(&relay), NegotiatorConfig::default());
    manager.start();

    let registry = PeerRegistry::new(relay, config.registry_config());
    registry.start();

    let engine = TransferEngine::new(Arc::clone(&manager), config.transfer_config());
    let frames = manager
        .take_frames()
        .context("transport frame stream already taken")?;
    engine.start_inbound(frames);

    Ok(Node {
        registry,
        manager,
        engine,
    })
}

async fn log_events(node: &Node) {
    let mut peer_events = node.registry.subscribe().await;
    tokio::spawn(async move {
        while let Some(event) = peer_events.recv().await {
            match event {
                PeerEvent::Discovered { record } => {
                    info!("Peer online: {} ({})", record.display_name, record.id);
                }
                PeerEvent::Lost { record } => {
                    info!("Peer gone: {} ({})", record.display_name, record.id);
                }
            }
        }
    });

    let mut channel_events = node.manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = channel_events.recv().await {
            match event {
                ChannelEvent::Connected { peer_id, transport } => {
                    info!("{} channel to {} up", transport, peer_id);
                }
                ChannelEvent::Disconnected { peer_id } => {
                    info!("Direct channel to {} down, using relay", peer_id);
                }
            }
        }
    });

    let mut transfer_events = node.engine.subscribe().await;
    let progress = node.engine.progress();
    tokio::spawn(async move {
        while let Some(event) = transfer_events.recv().await {
            match event {
                TransferEvent::SendStarted { summary } => {
                    info!("Sending {} to {}", summary.file_name, summary.peer_id);
                }
                TransferEvent::SendCompleted { summary } => {
                    info!("Sent {} ({} bytes)", summary.file_name, summary.file_size);
                }
                TransferEvent::SendFailed { summary, reason } => {
                    warn!("Sending {} failed: {}", summary.file_name, reason);
                }
                TransferEvent::ReceiveStarted { file_name, peer_id, .. } => {
                    info!("Receiving {} from {}", file_name, peer_id);
                }
                TransferEvent::ReceiveCompleted { path, .. } => {
                    let snapshot = progress.snapshot().await;
                    info!(
                        "Received {} ({}/{} files done)",
                        path.display(),
                        snapshot.completed_files,
                        snapshot.total_files
                    );
                }
                TransferEvent::ReceiveFailed { file_id, reason } => {
                    warn!("Receiving {} failed: {}", file_id, reason);
                }
            }
        }
    });
}

async fn run(node: Node) -> Result<()> {
    log_events(&node).await;
    info!("Daemon running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

async fn send(node: Node, peer: String, file: PathBuf, direct: bool) -> Result<()> {
    // Give the relay connection a moment to register before addressing.
    let mut waited = Duration::ZERO;
    while node.registry.get_peer(&peer).await.is_none() && waited < Duration::from_secs(10) {
        tokio::time::sleep(Duration::from_millis(250)).await;
        waited += Duration::from_millis(250);
    }
    if node.registry.get_peer(&peer).await.is_none() {
        bail!("peer {peer} is not known to any configured relay");
    }

    if direct {
        node.manager.connect_direct(&peer).await?;
        if node.manager.wait_for_direct(&peer, Duration::from_secs(8)).await {
            info!("Direct channel to {} established", peer);
        } else {
            info!("No direct channel to {}; sending over relay", peer);
        }
    }

    let mut events = node.engine.subscribe().await;
    let id = node.engine.send_file(&peer, &file).await?;

    loop {
        match events.recv().await {
            Some(TransferEvent::SendCompleted { summary }) if summary.id == id => {
                info!("Done");
                return Ok(());
            }
            Some(TransferEvent::SendFailed { summary, reason }) if summary.id == id => {
                bail!("transfer failed: {reason}");
            }
            Some(_) => {}
            None => bail!("transfer engine stopped unexpectedly"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (mut config, path) = load_config(&cli)?;
    let identity = resolve_identity(&mut config, &path);

    info!(
        "Device {} ({}) using relay {:?}",
        identity.display_name(),
        identity.device_id(),
        config.relay.urls
    );

    let node = start_node(&config, &identity)?;

    match cli.command {
        Command::Run => run(node).await,
        Command::Send { peer, file, direct } => send(node, peer, file, direct).await,
    }
}
