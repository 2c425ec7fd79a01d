//! Peer registry and announcer
//!
//! Keeps the table of known peers current by announcing this device over the
//! relay and digesting the announcements, peer lists and disconnects that
//! come back. Runs three periodic tasks once started:
//!
//! - Announcer: re-announces this device every 30 seconds
//! - Refresher: requests the relay's full peer list every 60 seconds
//! - Cleanup: every 120 seconds evicts peers idle for more than 5 minutes
//!
//! Consumers observe the table through [`PeerEvent`]s: `Discovered` fires
//! exactly once per peer id, `Lost` when the peer disconnects or times out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::transport::relay::{RelayEvent, RelayLink};
use crate::wire::{PeerSummary, SignalMessage};

pub mod events;

pub use events::PeerEvent;

/// Default interval between self-announcements
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between full peer-list refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between liveness sweeps
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(120);

/// Default inactivity window after which a peer is considered gone
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(300);

/// One known peer as tracked by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    /// Stable device id
    pub id: String,

    /// Human-readable name from the peer's announcement
    pub display_name: String,

    /// Advertised address, `"unknown"` when the peer could not tell
    pub address: String,

    /// Advertised port
    pub port: u16,

    /// Local time of the last announcement mentioning this peer
    pub last_seen: DateTime<Utc>,

    /// Whether the peer is currently considered reachable
    pub online: bool,
}

impl PeerRecord {
    fn from_summary(summary: &PeerSummary) -> Self {
        Self {
            id: summary.device_id.clone(),
            display_name: summary.device_name.clone(),
            address: summary.ip.clone(),
            port: summary.port,
            last_seen: Utc::now(),
            online: true,
        }
    }
}

/// Configuration for the peer registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often to re-announce this device
    pub announce_interval: Duration,

    /// How often to request the relay's full peer list
    pub refresh_interval: Duration,

    /// How often to run the liveness sweep
    pub cleanup_interval: Duration,

    /// Inactivity window before a peer is evicted
    pub peer_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }
}

/// Peer registry and announcer.
pub struct PeerRegistry {
    relay: Arc<RelayLink>,
    self_id: String,
    config: RegistryConfig,

    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,

    event_tx: mpsc::UnboundedSender<PeerEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl PeerRegistry {
    pub fn new(relay: Arc<RelayLink>, config: RegistryConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let self_id = relay.device_id().to_string();

        Arc::new(Self {
            relay,
            self_id,
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
        })
    }

    /// Get a receiver for peer events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let event_rx = self.event_rx.clone();
        tokio::spawn(async move {
            let mut rx_lock = event_rx.write().await;
            while let Some(event) = rx_lock.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Spawn the registry's background tasks. Call once, after
    /// [`RelayLink::start`].
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let relay_rx = self.relay.subscribe();
        tokio::spawn(registry.run_inbound(relay_rx));

        self.spawn_announcer();
        self.spawn_refresher();
        self.spawn_cleanup();
    }

    /// Snapshot of all currently known peers.
    pub async fn get_known_peers(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Look up one peer by device id.
    pub async fn get_peer(&self, device_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(device_id).cloned()
    }

    async fn run_inbound(self: Arc<Self>, mut relay_rx: broadcast::Receiver<RelayEvent>) {
        loop {
            match relay_rx.recv().await {
                Ok(RelayEvent::Connected { url }) => {
                    // The link already announced; pull the relay's current
                    // table so we do not wait a full refresh interval.
                    debug!("Relay {} up, requesting peer list", url);
                    let _ = self
                        .relay
                        .send(&SignalMessage::PeerListRequest {
                            device_id: self.self_id.clone(),
                        })
                        .await;
                }
                Ok(RelayEvent::Message(message)) => self.handle_message(message).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Registry lagged {} relay events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_message(&self, message: SignalMessage) {
        match message {
            SignalMessage::PeerAnnounce {
                device_id,
                device_name,
                ip,
                port,
                ..
            } => {
                self.upsert(PeerRecord {
                    id: device_id,
                    display_name: device_name,
                    address: ip,
                    port,
                    last_seen: Utc::now(),
                    online: true,
                })
                .await;
            }
            SignalMessage::PeerList { peers } => {
                for summary in &peers {
                    self.upsert(PeerRecord::from_summary(summary)).await;
                }
            }
            SignalMessage::PeerDisconnect { device_id } => {
                self.remove(&device_id).await;
            }
            _ => {}
        }
    }

    /// Insert or refresh one record. `Discovered` fires only on insert.
    async fn upsert(&self, record: PeerRecord) {
        if record.id == self.self_id {
            return;
        }

        let mut peers = self.peers.write().await;
        match peers.get_mut(&record.id) {
            Some(existing) => {
                existing.display_name = record.display_name;
                existing.address = record.address;
                existing.port = record.port;
                existing.last_seen = record.last_seen;
                existing.online = true;
            }
            None => {
                info!("Discovered peer {} ({})", record.display_name, record.id);
                peers.insert(record.id.clone(), record.clone());
                let _ = self.event_tx.send(PeerEvent::Discovered { record });
            }
        }
    }

    async fn remove(&self, device_id: &str) {
        let removed = self.peers.write().await.remove(device_id);
        if let Some(record) = removed {
            info!("Peer {} disconnected", device_id);
            let _ = self.event_tx.send(PeerEvent::Lost { record });
        }
    }

    /// Evict every peer idle for longer than the configured timeout.
    async fn evict_idle(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.peer_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut lost = Vec::new();
        {
            let mut peers = self.peers.write().await;
            let stale: Vec<String> = peers
                .iter()
                .filter(|(_, record)| record.last_seen < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(record) = peers.remove(&id) {
                    lost.push(record);
                }
            }
        }

        for record in lost {
            info!("Peer {} timed out", record.id);
            let _ = self.event_tx.send(PeerEvent::Lost { record });
        }
    }

    fn spawn_announcer(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(registry.config.announce_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = registry.relay.announce().await {
                    debug!("Announce skipped: {}", e);
                }
            }
        });
    }

    fn spawn_refresher(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(registry.config.refresh_interval);
            loop {
                ticker.tick().await;
                let request = SignalMessage::PeerListRequest {
                    device_id: registry.self_id.clone(),
                };
                if let Err(e) = registry.relay.send(&request).await {
                    debug!("Peer list refresh skipped: {}", e);
                }
            }
        });
    }

    fn spawn_cleanup(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(registry.config.cleanup_interval);
            loop {
                ticker.tick().await;
                registry.evict_idle().await;
            }
        });
    }
}
