//! Syncbridge relay server
//!
//! The rendezvous point peers bootstrap through: a WebSocket message bus on
//! `/ws` plus a small HTTP side channel on the same listener. The relay
//! keeps a table of connected peers, answers peer-list requests, routes
//! addressed messages to exactly one peer, broadcasts presence changes, and
//! offers a store-and-forward file drop for peers that are never online at
//! the same time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use syncbridge_protocol::{PeerSummary, SignalMessage};

pub mod http;
pub mod store;
pub mod ws;

use store::FileStore;

/// Default interval between liveness sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default inactivity window before a peer connection is dropped
pub const DEFAULT_PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default lifetime of an uploaded file
pub const DEFAULT_UPLOAD_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often the liveness and store sweeps run
    pub sweep_interval: Duration,

    /// Inactivity window before a registered peer is evicted
    pub peer_idle_timeout: Duration,

    /// Lifetime of files accepted over `/upload`
    pub upload_expiry: Duration,

    /// Directory uploaded files are kept in
    pub store_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            peer_idle_timeout: DEFAULT_PEER_IDLE_TIMEOUT,
            upload_expiry: DEFAULT_UPLOAD_EXPIRY,
            store_dir: std::env::temp_dir().join("syncbridge-relay-store"),
        }
    }
}

/// One registered peer connection.
pub(crate) struct PeerEntry {
    pub summary: PeerSummary,
    /// Identifies the socket that registered; a reconnect replaces it
    pub conn_id: u64,
    /// Outbound queue of the peer's socket
    pub sender: mpsc::UnboundedSender<String>,
    pub last_seen: Instant,
}

/// Shared state behind every handler.
pub struct RelayState {
    config: RelayConfig,
    peers: RwLock<HashMap<String, PeerEntry>>,
    pub(crate) store: FileStore,
    started_at: Instant,
    next_conn_id: AtomicU64,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let store = FileStore::new(config.store_dir.clone(), config.upload_expiry);
        Arc::new(Self {
            config,
            peers: RwLock::new(HashMap::new()),
            store,
            started_at: Instant::now(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn connected_peers(&self) -> usize {
        self.peers.read().await.len()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Summaries of all registered peers.
    pub async fn peer_summaries(&self) -> Vec<PeerSummary> {
        self.peers
            .read()
            .await
            .values()
            .map(|entry| entry.summary.clone())
            .collect()
    }

    /// Register or refresh a peer and answer with the current peer list.
    ///
    /// The announce itself is broadcast to every other peer.
    pub(crate) async fn register(
        &self,
        conn_id: u64,
        sender: mpsc::UnboundedSender<String>,
        summary: PeerSummary,
        announce_text: &str,
    ) {
        let device_id = summary.device_id.clone();
        let is_new = {
            let mut peers = self.peers.write().await;
            let is_new = !peers.contains_key(&device_id);
            peers.insert(
                device_id.clone(),
                PeerEntry {
                    summary,
                    conn_id,
                    sender: sender.clone(),
                    last_seen: Instant::now(),
                },
            );
            is_new
        };

        if is_new {
            info!("Peer {} registered", device_id);
        } else {
            debug!("Peer {} re-announced", device_id);
        }

        self.send_peer_list(&device_id, &sender).await;
        self.broadcast_except(&device_id, announce_text).await;
    }

    /// Reply with the relay's peer table, excluding the asking peer.
    pub(crate) async fn send_peer_list(
        &self,
        device_id: &str,
        sender: &mpsc::UnboundedSender<String>,
    ) {
        let peers = {
            let table = self.peers.read().await;
            table
                .values()
                .filter(|entry| entry.summary.device_id != device_id)
                .map(|entry| entry.summary.clone())
                .collect()
        };

        match (SignalMessage::PeerList { peers }).to_text() {
            Ok(text) => {
                let _ = sender.send(text);
            }
            Err(e) => warn!("Failed to serialize peer list: {}", e),
        }
    }

    /// Refresh a peer's liveness timestamp.
    pub(crate) async fn touch(&self, device_id: &str) {
        if let Some(entry) = self.peers.write().await.get_mut(device_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Deliver a message to exactly one peer. Unknown targets are dropped,
    /// never broadcast.
    pub(crate) async fn route(&self, to: &str, text: &str) {
        let peers = self.peers.read().await;
        match peers.get(to) {
            Some(entry) => {
                let _ = entry.sender.send(text.to_string());
            }
            None => {
                info!("Dropping message for unknown peer {}", to);
            }
        }
    }

    /// Send a raw message to every peer except `exclude`.
    pub(crate) async fn broadcast_except(&self, exclude: &str, text: &str) {
        let peers = self.peers.read().await;
        for entry in peers.values() {
            if entry.summary.device_id != exclude {
                let _ = entry.sender.send(text.to_string());
            }
        }
    }

    /// Remove a peer if it is still owned by the given socket and tell the
    /// others.
    pub(crate) async fn unregister(&self, conn_id: u64, device_id: &str) {
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(device_id) {
                Some(entry) if entry.conn_id == conn_id => {
                    peers.remove(device_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!("Peer {} disconnected", device_id);
            self.broadcast_disconnect(device_id).await;
        }
    }

    async fn broadcast_disconnect(&self, device_id: &str) {
        let message = SignalMessage::PeerDisconnect {
            device_id: device_id.to_string(),
        };
        if let Ok(text) = message.to_text() {
            self.broadcast_except(device_id, &text).await;
        }
    }

    /// Evict peers idle past the timeout or whose socket is gone.
    pub(crate) async fn sweep_idle(&self) {
        let stale: Vec<String> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|entry| {
                    entry.last_seen.elapsed() > self.config.peer_idle_timeout
                        || entry.sender.is_closed()
                })
                .map(|entry| entry.summary.device_id.clone())
                .collect()
        };

        for device_id in stale {
            warn!("Evicting idle peer {}", device_id);
            self.peers.write().await.remove(&device_id);
            self.broadcast_disconnect(&device_id).await;
        }
    }

    /// Spawn the periodic liveness and store sweeps.
    pub fn start_sweeps(self: &Arc<Self>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.sweep_interval);
            ticker.tick().await; // immediate first tick is pointless
            loop {
                ticker.tick().await;
                state.sweep_idle().await;
                state.store.sweep().await;
            }
        });
    }
}

/// Build the relay's router: WebSocket bus plus HTTP side channel.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(http::health))
        .route("/peers", get(http::peers))
        .route(
            "/upload",
            // Uploads are streamed to disk; the default body cap would
            // reject anything past 2 MiB.
            post(http::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/download/:file_id", get(http::download))
        .with_state(state)
}

/// Bind and serve the relay, returning the bound address, the shared state
/// and the server task.
pub async fn spawn(
    addr: SocketAddr,
    config: RelayConfig,
) -> anyhow::Result<(SocketAddr, Arc<RelayState>, JoinHandle<()>)> {
    let state = RelayState::new(config);
    state.start_sweeps();

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Relay listening on {}", local_addr);

    let app = router(Arc::clone(&state));
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Relay server stopped: {}", e);
        }
    });

    Ok((local_addr, state, handle))
}
