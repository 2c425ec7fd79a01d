//! Syncbridge wire messages
//!
//! Two message families travel over the network:
//!
//! - [`SignalMessage`]: the relay wire protocol, JSON over a persistent
//!   WebSocket channel. A closed tagged union decoded exactly once at the
//!   transport boundary; unknown tags are preserved as raw JSON so the relay
//!   can keep broadcasting legacy message kinds.
//! - [`TransferFrame`]: the peer-to-peer transfer protocol (`file-start` and
//!   chunk units). Frames travel as newline-delimited JSON on a direct
//!   channel, or wrapped in `peer-message` / `peer-data` envelopes when only
//!   the relay path is available.
//!
//! Field names on the wire are camelCase (`deviceId`, `fileId`, ...) to stay
//! compatible with existing peers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{ProtocolError, Result};

/// Summary of a connected peer, as carried inside `peer-list` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub device_id: String,
    pub device_name: String,
    pub ip: String,
    pub port: u16,
    /// UNIX timestamp in milliseconds of the peer's last announcement
    pub timestamp: i64,
}

/// Endpoint description exchanged in `offer` / `answer` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    /// Identifies one negotiation attempt; candidates carry the same id
    pub session_id: Uuid,
    /// TCP port the sending side is listening on
    pub port: u16,
}

/// A connectivity candidate exchanged during direct-channel negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub session_id: Uuid,
    pub ip: String,
    pub port: u16,
}

/// Messages understood by the relay and its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Presence announcement, also used as the registration message
    #[serde(rename_all = "camelCase")]
    PeerAnnounce {
        device_id: String,
        device_name: String,
        /// Advertised address, `"unknown"` when the peer cannot tell
        ip: String,
        port: u16,
        timestamp: i64,
    },

    /// Ask the relay for its current peer table
    #[serde(rename_all = "camelCase")]
    PeerListRequest { device_id: String },

    /// Relay response listing all connected peers
    PeerList { peers: Vec<PeerSummary> },

    /// Broadcast by the relay when a peer's connection goes away
    #[serde(rename_all = "camelCase")]
    PeerDisconnect { device_id: String },

    /// Addressed JSON payload routed peer to peer through the relay
    PeerMessage {
        from: String,
        to: String,
        message: Value,
    },

    /// Addressed binary payload (base64) routed through the relay
    PeerData {
        from: String,
        to: String,
        data: String,
    },

    /// Direct-channel negotiation: initiator's endpoint description
    Offer {
        from: String,
        to: String,
        payload: SessionDescription,
    },

    /// Direct-channel negotiation: responder's endpoint description
    Answer {
        from: String,
        to: String,
        payload: SessionDescription,
    },

    /// Direct-channel negotiation: a connectivity candidate
    IceCandidate {
        from: String,
        to: String,
        payload: Candidate,
    },
}

impl SignalMessage {
    /// The `to` device id for addressed message kinds, `None` otherwise.
    ///
    /// Addressed kinds are delivered exactly to the resolved peer or dropped;
    /// they are never broadcast.
    pub fn addressed_to(&self) -> Option<&str> {
        match self {
            SignalMessage::PeerMessage { to, .. }
            | SignalMessage::PeerData { to, .. }
            | SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// The originating device id, when the message carries one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalMessage::PeerAnnounce { device_id, .. }
            | SignalMessage::PeerListRequest { device_id }
            | SignalMessage::PeerDisconnect { device_id } => Some(device_id),
            SignalMessage::PeerMessage { from, .. }
            | SignalMessage::PeerData { from, .. }
            | SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => Some(from),
            SignalMessage::PeerList { .. } => None,
        }
    }

    /// Serialize to the JSON text form sent over the channel.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome of decoding one inbound relay message.
///
/// Messages with a `type` tag the protocol does not know are kept as raw
/// JSON: the relay broadcasts them to all other peers for backward
/// compatibility with older message formats, and clients ignore them.
#[derive(Debug, Clone)]
pub enum Decoded {
    Known(SignalMessage),
    Unrecognized(Value),
}

/// Decode one inbound message from its JSON text form.
///
/// # Errors
///
/// Returns `InvalidMessage` if the text is not a JSON object or carries no
/// `type` tag at all.
pub fn decode(text: &str) -> Result<Decoded> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::InvalidMessage(format!("not valid JSON: {e}")))?;

    if value.get("type").and_then(Value::as_str).is_none() {
        return Err(ProtocolError::InvalidMessage(
            "message has no type tag".to_string(),
        ));
    }

    match serde_json::from_value::<SignalMessage>(value.clone()) {
        Ok(message) => Ok(Decoded::Known(message)),
        Err(_) => Ok(Decoded::Unrecognized(value)),
    }
}

/// Peer-to-peer transfer protocol frames.
///
/// Chunk payloads are base64 inside the frame on both transports; the direct
/// channel carries frames as newline-delimited JSON and the relay path wraps
/// them in an addressed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferFrame {
    /// Descriptor sent before any chunk of a file
    #[serde(rename_all = "camelCase")]
    FileStart {
        file_id: Uuid,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },

    /// One self-describing chunk unit
    #[serde(rename_all = "camelCase")]
    FileChunk {
        file_id: Uuid,
        index: u32,
        /// Payload size in bytes (before base64 encoding)
        size: u32,
        /// Hex-encoded SHA-256 digest of the payload bytes
        hash: String,
        total_chunks: u32,
        /// Base64-encoded payload bytes
        data: String,
    },
}

impl TransferFrame {
    pub fn file_id(&self) -> Uuid {
        match self {
            TransferFrame::FileStart { file_id, .. } | TransferFrame::FileChunk { file_id, .. } => {
                *file_id
            }
        }
    }

    /// Whether this frame carries bulk payload bytes.
    ///
    /// Payload-bearing frames travel as `peer-data` on the relay path,
    /// everything else as `peer-message`.
    pub fn carries_payload(&self) -> bool {
        matches!(self, TransferFrame::FileChunk { .. })
    }
}

/// Current UNIX timestamp in milliseconds, as used in announcements.
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}
