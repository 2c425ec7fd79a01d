//! Transport manager
//!
//! Single entry point for peer traffic. Owns the relay link, the negotiator
//! and the table of established direct channels, and presents one outbound
//! call ([`TransportManager::send_frame`]) and one inbound frame stream
//! ([`TransportManager::take_frames`]) regardless of which channel a frame
//! travels over.
//!
//! Send policy: direct channel when one is up, relay otherwise. A failed
//! direct send tears the channel down and the frame is re-sent over the
//! relay in the same call, so callers never observe the fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::transport::direct::DirectChannel;
use crate::transport::negotiator::{Negotiator, NegotiatorConfig};
use crate::transport::relay::{RelayEvent, RelayLink};
use crate::transport::{ChannelEvent, FrameSink, TransportType};
use crate::wire::{SignalMessage, TransferFrame};
use crate::{ProtocolError, Result};

/// Capacity of the channel-event fan-out
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How often [`TransportManager::wait_for_direct`] re-checks the channel table
const DIRECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct TransportManager {
    relay: Arc<RelayLink>,
    negotiator: Arc<Negotiator>,
    device_id: String,

    channels: Arc<RwLock<HashMap<String, DirectChannel>>>,
    events: broadcast::Sender<ChannelEvent>,

    frames_tx: mpsc::UnboundedSender<(String, TransferFrame)>,
    frames_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, TransferFrame)>>>,

    closed_tx: mpsc::UnboundedSender<(String, u64)>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, u64)>>>,
    established_rx: Mutex<Option<mpsc::UnboundedReceiver<TcpStream>>>,
}

impl TransportManager {
    pub fn new(relay: Arc<RelayLink>, negotiator_config: NegotiatorConfig) -> Arc<Self> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let negotiator = Negotiator::new(Arc::clone(&relay), negotiator_config, established_tx);
        let device_id = relay.device_id().to_string();

        Arc::new(Self {
            relay,
            negotiator,
            device_id,
            channels: Arc::new(RwLock::new(HashMap::new())),
            events,
            frames_tx,
            frames_rx: Mutex::new(Some(frames_rx)),
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            established_rx: Mutex::new(Some(established_rx)),
        })
    }

    /// Spawn the manager's background tasks. Call once, after
    /// [`RelayLink::start`].
    pub fn start(self: &Arc<Self>) {
        let established_rx = self
            .established_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(rx) = established_rx {
            let manager = Arc::clone(self);
            tokio::spawn(manager.run_established(rx));
        }

        let closed_rx = self.closed_rx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(rx) = closed_rx {
            let manager = Arc::clone(self);
            tokio::spawn(manager.run_closed(rx));
        }

        let manager = Arc::clone(self);
        let relay_rx = self.relay.subscribe();
        tokio::spawn(manager.run_relay_inbound(relay_rx));
    }

    /// The relay link this manager sends through.
    pub fn relay(&self) -> &Arc<RelayLink> {
        &self.relay
    }

    /// Subscribe to direct-channel lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Take the inbound frame stream. Yields `None` after the first call.
    pub fn take_frames(&self) -> Option<mpsc::UnboundedReceiver<(String, TransferFrame)>> {
        self.frames_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Kick off direct-channel negotiation with a peer. No-op when a channel
    /// already exists or a negotiation is pending.
    pub async fn connect_direct(&self, peer_id: &str) -> Result<()> {
        if self.channels.read().await.contains_key(peer_id) {
            return Ok(());
        }
        self.negotiator.initiate(peer_id).await
    }

    /// Wait until a direct channel to the peer exists, up to `ceiling`.
    ///
    /// Returns `true` if one came up in time. A `false` result is not an
    /// error: the relay path remains usable.
    pub async fn wait_for_direct(&self, peer_id: &str, ceiling: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + ceiling;
        loop {
            if self.channels.read().await.contains_key(peer_id) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DIRECT_POLL_INTERVAL).await;
        }
    }

    /// Deliver one frame over the best available channel.
    pub async fn send_frame(&self, peer_id: &str, frame: &TransferFrame) -> Result<()> {
        let direct_result = {
            let channels = self.channels.read().await;
            channels.get(peer_id).map(|chan| chan.send(frame))
        };

        match direct_result {
            Some(Ok(())) => return Ok(()),
            Some(Err(e)) => {
                warn!(
                    "Direct send to {} failed ({}), falling back to relay",
                    peer_id, e
                );
                self.drop_channel(peer_id).await;
            }
            None => {}
        }

        let envelope = relay_envelope(&self.device_id, peer_id, frame)?;
        self.relay.send(&envelope).await
    }

    /// The channel kind the next frame to this peer would use.
    pub async fn active_transport(&self, peer_id: &str) -> TransportType {
        if self.channels.read().await.contains_key(peer_id) {
            TransportType::Direct
        } else {
            TransportType::Relay
        }
    }

    async fn drop_channel(&self, peer_id: &str) {
        if self.channels.write().await.remove(peer_id).is_some() {
            let _ = self.events.send(ChannelEvent::Disconnected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    async fn run_established(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TcpStream>) {
        while let Some(stream) = rx.recv().await {
            match DirectChannel::establish(
                stream,
                &self.device_id,
                self.frames_tx.clone(),
                self.closed_tx.clone(),
            )
            .await
            {
                Ok(channel) => self.register_channel(channel).await,
                Err(e) => debug!("Direct channel handshake failed: {}", e),
            }
        }
    }

    async fn register_channel(&self, channel: DirectChannel) {
        let peer_id = channel.peer_id().to_string();
        {
            let mut channels = self.channels.write().await;
            if channels.contains_key(&peer_id) {
                // Both sides of the connection race succeeded; first one wins.
                debug!("Dropping duplicate direct channel to {}", peer_id);
                return;
            }
            channels.insert(peer_id.clone(), channel);
        }
        self.negotiator.mark_established(&peer_id).await;
        info!("Direct channel to {} established", peer_id);
        let _ = self.events.send(ChannelEvent::Connected {
            peer_id,
            transport: TransportType::Direct,
        });
    }

    async fn run_closed(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(String, u64)>) {
        while let Some((peer_id, channel_id)) = rx.recv().await {
            // The close may belong to a channel that lost the accept/connect
            // race and was never registered; only tear down a matching entry.
            let removed = {
                let mut channels = self.channels.write().await;
                match channels.get(&peer_id) {
                    Some(chan) if chan.id() == channel_id => channels.remove(&peer_id).is_some(),
                    _ => false,
                }
            };
            if removed {
                info!("Direct channel to {} closed", peer_id);
                let _ = self.events.send(ChannelEvent::Disconnected { peer_id });
            } else {
                debug!("Ignoring close of superseded channel to {}", peer_id);
            }
        }
    }

    async fn run_relay_inbound(self: Arc<Self>, mut rx: broadcast::Receiver<RelayEvent>) {
        loop {
            match rx.recv().await {
                Ok(RelayEvent::Message(message)) => self.handle_relay_message(message).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Transport manager lagged {} relay events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_relay_message(self: &Arc<Self>, message: SignalMessage) {
        match &message {
            SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. } => {
                if let Err(e) = self.negotiator.handle_signal(&message).await {
                    warn!("Negotiation signal handling failed: {}", e);
                }
            }
            SignalMessage::PeerMessage { from, message, .. } => {
                match serde_json::from_value::<TransferFrame>(message.clone()) {
                    Ok(frame) => {
                        let _ = self.frames_tx.send((from.clone(), frame));
                    }
                    Err(_) => debug!("Non-transfer peer message from {}", from),
                }
            }
            SignalMessage::PeerData { from, data, .. } => match decode_relay_payload(data) {
                Ok(frame) => {
                    let _ = self.frames_tx.send((from.clone(), frame));
                }
                Err(e) => warn!("Undecodable peer data from {}: {}", from, e),
            },
            _ => {}
        }
    }
}

impl FrameSink for TransportManager {
    async fn send_frame(&self, peer_id: &str, frame: &TransferFrame) -> Result<()> {
        TransportManager::send_frame(self, peer_id, frame).await
    }

    async fn active_transport(&self, peer_id: &str) -> TransportType {
        TransportManager::active_transport(self, peer_id).await
    }
}

/// Wrap a frame for the relay path.
///
/// Payload-bearing frames travel as `peer-data` with the frame JSON base64
/// encoded; everything else is embedded as JSON inside `peer-message`.
fn relay_envelope(from: &str, to: &str, frame: &TransferFrame) -> Result<SignalMessage> {
    if frame.carries_payload() {
        let bytes = serde_json::to_vec(frame)?;
        Ok(SignalMessage::PeerData {
            from: from.to_string(),
            to: to.to_string(),
            data: BASE64.encode(bytes),
        })
    } else {
        Ok(SignalMessage::PeerMessage {
            from: from.to_string(),
            to: to.to_string(),
            message: serde_json::to_value(frame)?,
        })
    }
}

/// Recover a frame from a `peer-data` envelope.
fn decode_relay_payload(data: &str) -> Result<TransferFrame> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| ProtocolError::InvalidMessage(format!("bad base64 payload: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::relay::RelayLinkConfig;
    use crate::StaticIdentity;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn test_manager() -> Arc<TransportManager> {
        let identity = StaticIdentity::new("dev-a", "A");
        let relay = RelayLink::new(vec![], &identity, RelayLinkConfig::default());
        TransportManager::new(relay, NegotiatorConfig::default())
    }

    fn chunk_frame() -> TransferFrame {
        TransferFrame::FileChunk {
            file_id: Uuid::new_v4(),
            index: 0,
            size: 3,
            hash: "00".repeat(32),
            total_chunks: 1,
            data: "YWJj".to_string(),
        }
    }

    #[test]
    fn test_relay_envelope_kinds() {
        let start = TransferFrame::FileStart {
            file_id: Uuid::new_v4(),
            file_name: "x".to_string(),
            file_size: 1,
            total_chunks: 1,
        };
        assert!(matches!(
            relay_envelope("a", "b", &start).unwrap(),
            SignalMessage::PeerMessage { .. }
        ));
        assert!(matches!(
            relay_envelope("a", "b", &chunk_frame()).unwrap(),
            SignalMessage::PeerData { .. }
        ));
    }

    #[test]
    fn test_relay_payload_roundtrip() {
        let frame = chunk_frame();
        let envelope = relay_envelope("a", "b", &frame).unwrap();
        match envelope {
            SignalMessage::PeerData { data, .. } => {
                assert_eq!(decode_relay_payload(&data).unwrap(), frame);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_active_transport_defaults_to_relay() {
        let manager = test_manager();
        assert_eq!(manager.active_transport("dev-b").await, TransportType::Relay);
    }

    #[tokio::test]
    async fn test_wait_for_direct_gives_up() {
        let manager = test_manager();
        assert!(
            !manager
                .wait_for_direct("dev-b", Duration::from_millis(50))
                .await
        );
    }

    #[tokio::test]
    async fn test_send_without_any_channel_fails() {
        let manager = test_manager();
        let result = manager.send_frame("dev-b", &chunk_frame()).await;
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
    }

    #[test]
    fn test_frames_can_only_be_taken_once() {
        let manager = test_manager();
        assert!(manager.take_frames().is_some());
        assert!(manager.take_frames().is_none());
    }

    /// One end wired into the manager, the other standalone, as if both
    /// sides' negotiations produced a connection.
    async fn direct_pair(
        manager: &Arc<TransportManager>,
        remote_id: &str,
    ) -> (
        DirectChannel,
        DirectChannel,
        mpsc::UnboundedReceiver<(String, TransferFrame)>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (local_stream, remote_stream) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.unwrap().0
        });

        let (remote_frames_tx, remote_frames) = mpsc::unbounded_channel();
        let (remote_closed_tx, _remote_closed) = mpsc::unbounded_channel();

        let (local, remote) = tokio::join!(
            DirectChannel::establish(
                local_stream.unwrap(),
                &manager.device_id,
                manager.frames_tx.clone(),
                manager.closed_tx.clone(),
            ),
            DirectChannel::establish(remote_stream, remote_id, remote_frames_tx, remote_closed_tx),
        );
        (local.unwrap(), remote.unwrap(), remote_frames)
    }

    #[tokio::test]
    async fn test_losing_duplicate_close_keeps_registered_channel() {
        let manager = test_manager();
        manager.start();

        let (winner, _remote_winner, mut winner_frames) = direct_pair(&manager, "dev-b").await;
        let (loser, remote_loser, _loser_frames) = direct_pair(&manager, "dev-b").await;

        manager.register_channel(winner).await;
        // Second connection from the accept/connect race; the first one wins
        // and this one is dropped on the spot.
        manager.register_channel(loser).await;

        // The loser's socket dies; its close notification must not evict the
        // registered channel.
        drop(remote_loser);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            manager.active_transport("dev-b").await,
            TransportType::Direct
        );

        manager.send_frame("dev-b", &chunk_frame()).await.unwrap();
        let (from, frame) = tokio::time::timeout(Duration::from_secs(1), winner_frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, "dev-a");
        assert!(frame.carries_payload());
    }
}
