//! Relay message channel
//!
//! Maintains one persistent WebSocket connection per configured relay
//! endpoint, in priority order (primary first, then fallbacks). Every
//! connection announces this device on open; lost connections are retried
//! after a fixed delay, indefinitely.
//!
//! Inbound messages are decoded once and fanned out to subscribers over a
//! broadcast channel; outbound messages go to every currently connected
//! relay, which is how both broadcasts (announcements) and addressed
//! messages (the relay routes on `to`) are delivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::wire::{self, Decoded, SignalMessage};
use crate::{DeviceIdentity, ProtocolError, Result};

/// Default delay between reconnection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the inbound fan-out channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Relay link configuration
#[derive(Debug, Clone)]
pub struct RelayLinkConfig {
    /// Fixed delay before retrying a lost relay connection
    pub reconnect_delay: Duration,

    /// Address advertised in announcements, `"unknown"` when not routable
    pub advertised_ip: String,

    /// Port advertised in announcements
    pub advertised_port: u16,
}

impl Default for RelayLinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            advertised_ip: "unknown".to_string(),
            advertised_port: 0,
        }
    }
}

/// Events emitted by the relay link
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A relay connection was (re)established
    Connected { url: String },

    /// A relay connection was lost; a reconnect is already scheduled
    Disconnected { url: String },

    /// A decoded inbound message
    Message(SignalMessage),

    /// An inbound message with an unknown type tag, kept as raw JSON
    Unrecognized(Value),
}

/// Client side of the relay message channel.
pub struct RelayLink {
    urls: Vec<String>,
    device_id: String,
    device_name: String,
    config: RelayLinkConfig,

    /// Outbound queues of the currently live connections, keyed by URL
    conns: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<String>>>>,

    events: broadcast::Sender<RelayEvent>,
}

impl RelayLink {
    /// Create a relay link for the given endpoints, primary first.
    pub fn new(
        urls: Vec<String>,
        identity: &dyn DeviceIdentity,
        config: RelayLinkConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            urls,
            device_id: identity.device_id().to_string(),
            device_name: identity.display_name().to_string(),
            config,
            conns: Arc::new(RwLock::new(HashMap::new())),
            events,
        })
    }

    /// Spawn one connection-maintenance task per configured endpoint.
    pub fn start(self: &Arc<Self>) {
        for url in self.urls.clone() {
            let link = Arc::clone(self);
            tokio::spawn(async move {
                link.maintain_connection(url).await;
            });
        }
    }

    /// Subscribe to relay events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// This device's id, as used in outgoing envelopes.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Number of currently established relay connections.
    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Send a message through every connected relay.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if no relay connection is currently up.
    pub async fn send(&self, message: &SignalMessage) -> Result<()> {
        let text = message.to_text()?;
        let conns = self.conns.read().await;

        let mut delivered = 0;
        for tx in conns.values() {
            if tx.send(text.clone()).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            return Err(ProtocolError::Transport(
                "no relay connection available".to_string(),
            ));
        }
        Ok(())
    }

    /// Build this device's announcement message.
    pub fn announce_message(&self) -> SignalMessage {
        SignalMessage::PeerAnnounce {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            ip: self.config.advertised_ip.clone(),
            port: self.config.advertised_port,
            timestamp: wire::current_timestamp(),
        }
    }

    /// Announce this device on every connected relay.
    pub async fn announce(&self) -> Result<()> {
        self.send(&self.announce_message()).await
    }

    async fn maintain_connection(self: Arc<Self>, url: String) {
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("Connected to relay {}", url);

                    let (out_tx, out_rx) = mpsc::unbounded_channel();

                    // Announce immediately so the relay registers us and
                    // replies with its current peer list.
                    if let Ok(text) = self.announce_message().to_text() {
                        let _ = out_tx.send(text);
                    }

                    self.conns.write().await.insert(url.clone(), out_tx);
                    let _ = self.events.send(RelayEvent::Connected { url: url.clone() });

                    self.run_connection(ws_stream, out_rx).await;

                    self.conns.write().await.remove(&url);
                    let _ = self
                        .events
                        .send(RelayEvent::Disconnected { url: url.clone() });
                    warn!("Lost relay connection to {}", url);
                }
                Err(e) => {
                    warn!("Failed to connect to relay {}: {}", url, e);
                }
            }

            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn run_connection(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut out_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let (mut sink, mut stream) = ws_stream.split();

        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            warn!("Relay send failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match wire::decode(text) {
            Ok(Decoded::Known(message)) => {
                let _ = self.events.send(RelayEvent::Message(message));
            }
            Ok(Decoded::Unrecognized(value)) => {
                debug!(
                    "Ignoring unrecognized relay message kind: {}",
                    value.get("type").and_then(|v| v.as_str()).unwrap_or("?")
                );
                let _ = self.events.send(RelayEvent::Unrecognized(value));
            }
            Err(e) => warn!("Dropping malformed relay message: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticIdentity;

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let identity = StaticIdentity::new("dev-a", "A");
        let link = RelayLink::new(vec![], &identity, RelayLinkConfig::default());

        let result = link.send(&link.announce_message()).await;
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
    }

    #[test]
    fn test_announce_message_fields() {
        let identity = StaticIdentity::new("dev-a", "Laptop");
        let config = RelayLinkConfig {
            advertised_port: 4412,
            ..Default::default()
        };
        let link = RelayLink::new(vec![], &identity, config);

        match link.announce_message() {
            SignalMessage::PeerAnnounce {
                device_id,
                device_name,
                ip,
                port,
                ..
            } => {
                assert_eq!(device_id, "dev-a");
                assert_eq!(device_name, "Laptop");
                assert_eq!(ip, "unknown");
                assert_eq!(port, 4412);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
