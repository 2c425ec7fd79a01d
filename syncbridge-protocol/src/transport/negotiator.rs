//! Direct-channel negotiation
//!
//! Establishes peer-to-peer TCP connections by exchanging `offer`, `answer`
//! and `ice-candidate` messages over the relay. Both sides bind a listener
//! and advertise candidates for it, then race inbound accepts against
//! outbound connects; whichever connection completes its hello handshake
//! first becomes the peer's direct channel and any later duplicate is
//! dropped by the owner.
//!
//! Negotiation is best-effort: a session that produces no connection within
//! the timeout is abandoned silently and traffic stays on the relay.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::wire::{Candidate, SessionDescription, SignalMessage};
use crate::transport::relay::RelayLink;
use crate::Result;

/// How long an outbound connect to one candidate may take
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Negotiator configuration
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Ceiling for one negotiation attempt, accept and connect included
    pub timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug)]
struct PendingSession {
    session_id: Uuid,
}

/// Drives direct-channel negotiation for all peers.
pub struct Negotiator {
    relay: Arc<RelayLink>,
    device_id: String,
    config: NegotiatorConfig,

    /// One pending session per peer; repeated initiations are no-ops
    sessions: Arc<RwLock<HashMap<String, PendingSession>>>,

    /// Freshly connected sockets, handed to the owner for the handshake
    established: mpsc::UnboundedSender<TcpStream>,
}

impl Negotiator {
    pub fn new(
        relay: Arc<RelayLink>,
        config: NegotiatorConfig,
        established: mpsc::UnboundedSender<TcpStream>,
    ) -> Arc<Self> {
        let device_id = relay.device_id().to_string();
        Arc::new(Self {
            relay,
            device_id,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            established,
        })
    }

    /// Start negotiating a direct channel to `peer_id`.
    ///
    /// Idempotent while a session for the peer is pending. The caller is
    /// expected to skip peers that already have a direct channel.
    pub async fn initiate(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        let session_id = Uuid::new_v4();
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(peer_id) {
                debug!("Negotiation with {} already pending", peer_id);
                return Ok(());
            }
            sessions.insert(peer_id.to_string(), PendingSession { session_id });
        }

        if let Err(e) = self.start_offer(peer_id, session_id).await {
            self.sessions.write().await.remove(peer_id);
            return Err(e);
        }
        Ok(())
    }

    async fn start_offer(self: &Arc<Self>, peer_id: &str, session_id: Uuid) -> Result<()> {
        let port = self.open_listener(peer_id).await?;

        info!(
            "Negotiating direct channel with {} (session {}, port {})",
            peer_id, session_id, port
        );

        self.relay
            .send(&SignalMessage::Offer {
                from: self.device_id.clone(),
                to: peer_id.to_string(),
                payload: SessionDescription { session_id, port },
            })
            .await?;
        self.send_candidates(peer_id, session_id, port).await?;
        self.arm_timeout(peer_id);
        Ok(())
    }

    /// Feed one negotiation message received over the relay.
    pub async fn handle_signal(self: &Arc<Self>, message: &SignalMessage) -> Result<()> {
        match message {
            SignalMessage::Offer { from, payload, .. } => {
                self.handle_offer(from, payload).await
            }
            SignalMessage::Answer { from, payload, .. } => {
                debug!(
                    "Answer from {} for session {}: peer listening on {}",
                    from, payload.session_id, payload.port
                );
                Ok(())
            }
            SignalMessage::IceCandidate { from, payload, .. } => {
                self.handle_candidate(from, payload).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Clear the peer's pending session once a channel is registered.
    pub async fn mark_established(&self, peer_id: &str) {
        self.sessions.write().await.remove(peer_id);
    }

    async fn handle_offer(
        self: &Arc<Self>,
        from: &str,
        description: &SessionDescription,
    ) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(from) {
                // Both sides initiated at once; keep the existing session and
                // let the connection race settle it.
                debug!("Offer from {} while a session is already pending", from);
                return Ok(());
            }
            sessions.insert(
                from.to_string(),
                PendingSession {
                    session_id: description.session_id,
                },
            );
        }

        if let Err(e) = self.start_answer(from, description.session_id).await {
            self.sessions.write().await.remove(from);
            return Err(e);
        }
        Ok(())
    }

    async fn start_answer(self: &Arc<Self>, from: &str, session_id: Uuid) -> Result<()> {
        let port = self.open_listener(from).await?;
        info!(
            "Answering offer from {} (session {}, port {})",
            from, session_id, port
        );

        self.relay
            .send(&SignalMessage::Answer {
                from: self.device_id.clone(),
                to: from.to_string(),
                payload: SessionDescription { session_id, port },
            })
            .await?;
        self.send_candidates(from, session_id, port).await?;
        self.arm_timeout(from);
        Ok(())
    }

    async fn handle_candidate(self: &Arc<Self>, from: &str, candidate: &Candidate) {
        let known = {
            let sessions = self.sessions.read().await;
            sessions
                .get(from)
                .map(|s| s.session_id == candidate.session_id)
                .unwrap_or(false)
        };
        if !known {
            debug!(
                "Ignoring candidate from {} for unknown session {}",
                from, candidate.session_id
            );
            return;
        }

        let target: SocketAddr = match candidate.ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, candidate.port),
            Err(_) => {
                warn!("Unusable candidate address from {}: {}", from, candidate.ip);
                return;
            }
        };

        let established = self.established.clone();
        let peer = from.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    debug!("Connected to candidate {} of {}", target, peer);
                    let _ = established.send(stream);
                }
                Ok(Err(e)) => debug!("Candidate {} of {} unreachable: {}", target, peer, e),
                Err(_) => debug!("Candidate {} of {} timed out", target, peer),
            }
        });
    }

    /// Bind a listener for one session and accept at most one connection.
    async fn open_listener(self: &Arc<Self>, peer_id: &str) -> Result<u16> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();

        let established = self.established.clone();
        let timeout = self.config.timeout;
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, listener.accept()).await {
                Ok(Ok((stream, remote))) => {
                    debug!("Accepted direct connection from {} for {}", remote, peer);
                    let _ = established.send(stream);
                }
                Ok(Err(e)) => warn!("Accept for {} failed: {}", peer, e),
                Err(_) => debug!("No inbound connection for {} before timeout", peer),
            }
        });

        Ok(port)
    }

    async fn send_candidates(&self, peer_id: &str, session_id: Uuid, port: u16) -> Result<()> {
        for ip in local_candidate_ips().await {
            self.relay
                .send(&SignalMessage::IceCandidate {
                    from: self.device_id.clone(),
                    to: peer_id.to_string(),
                    payload: Candidate {
                        session_id,
                        ip,
                        port,
                    },
                })
                .await?;
        }
        Ok(())
    }

    fn arm_timeout(self: &Arc<Self>, peer_id: &str) {
        let negotiator = Arc::clone(self);
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(negotiator.config.timeout).await;
            let mut sessions = negotiator.sessions.write().await;
            if sessions.remove(&peer).is_some() {
                debug!("Negotiation with {} timed out, staying on relay", peer);
            }
        });
    }
}

/// Addresses worth advertising as candidates: loopback for same-host peers
/// plus the interface address the default route would use.
async fn local_candidate_ips() -> Vec<String> {
    let mut ips = vec!["127.0.0.1".to_string()];

    // Connecting a UDP socket picks the outbound interface without sending
    // any packet.
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await {
        if socket.connect("8.8.8.8:80").await.is_ok() {
            if let Ok(addr) = socket.local_addr() {
                let ip = addr.ip().to_string();
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
    }

    ips
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::relay::RelayLinkConfig;
    use crate::StaticIdentity;

    fn test_negotiator() -> (Arc<Negotiator>, mpsc::UnboundedReceiver<TcpStream>) {
        let identity = StaticIdentity::new("dev-a", "A");
        let relay = RelayLink::new(vec![], &identity, RelayLinkConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (Negotiator::new(relay, NegotiatorConfig::default(), tx), rx)
    }

    #[tokio::test]
    async fn test_local_candidates_include_loopback() {
        let ips = local_candidate_ips().await;
        assert!(ips.contains(&"127.0.0.1".to_string()));
    }

    #[tokio::test]
    async fn test_initiate_requires_relay() {
        // With no relay connection the offer cannot be sent.
        let (negotiator, _established) = test_negotiator();
        assert!(negotiator.initiate("dev-b").await.is_err());
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_session_is_ignored() {
        let (negotiator, mut established) = test_negotiator();

        // A reachable listener, but the session id matches nothing pending.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        negotiator
            .handle_candidate(
                "dev-b",
                &Candidate {
                    session_id: Uuid::new_v4(),
                    ip: "127.0.0.1".to_string(),
                    port,
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(established.try_recv().is_err());
    }
}
