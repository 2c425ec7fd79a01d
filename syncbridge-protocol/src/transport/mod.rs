//! Peer transport layer
//!
//! Two channel kinds carry transfer frames between peers:
//!
//! - [`relay::RelayLink`]: always-available WebSocket channel through the
//!   relay server, frames wrapped in addressed envelopes.
//! - [`direct::DirectChannel`]: newline-delimited JSON over a negotiated
//!   peer-to-peer TCP connection.
//!
//! [`manager::TransportManager`] is the single entry point: it owns both,
//! prefers the direct channel when one is established, and falls back to the
//! relay transparently when a direct send fails.

use std::fmt;
use std::future::Future;

use crate::wire::TransferFrame;
use crate::Result;

pub mod direct;
pub mod manager;
pub mod negotiator;
pub mod relay;

pub use direct::DirectChannel;
pub use manager::TransportManager;
pub use negotiator::{Negotiator, NegotiatorConfig};
pub use relay::{RelayEvent, RelayLink, RelayLinkConfig, DEFAULT_RECONNECT_DELAY};

/// The channel kind a frame travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Negotiated peer-to-peer TCP channel
    Direct,
    /// WebSocket channel through the relay server
    Relay,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Direct => write!(f, "direct"),
            TransportType::Relay => write!(f, "relay"),
        }
    }
}

/// Lifecycle events for per-peer direct channels.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A direct channel to the peer is established and usable
    Connected {
        peer_id: String,
        transport: TransportType,
    },

    /// The direct channel went away (closed, failed, or negotiation timed
    /// out); sends to this peer use the relay again
    Disconnected { peer_id: String },
}

/// Anything able to deliver transfer frames to a peer.
///
/// The transfer engine is written against this seam so it can be driven by
/// the real [`TransportManager`] or by an in-memory fake in tests.
pub trait FrameSink: Send + Sync + 'static {
    /// Deliver one frame to the peer, choosing the best available channel.
    fn send_frame(
        &self,
        peer_id: &str,
        frame: &TransferFrame,
    ) -> impl Future<Output = Result<()>> + Send;

    /// The channel kind the next frame to this peer would use.
    fn active_transport(&self, peer_id: &str) -> impl Future<Output = TransportType> + Send;
}
