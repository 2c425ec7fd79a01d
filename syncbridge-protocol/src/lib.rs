//! Syncbridge Protocol Implementation
//!
//! This library provides the peer transport and chunked file transfer core
//! of syncbridge: relay-backed peer discovery, direct-channel negotiation
//! with transparent relay fallback, and an integrity-checked chunked
//! transfer engine with aggregate progress reporting.

pub mod fs_utils;
pub mod identity;
pub mod registry;
pub mod transfer;
pub mod transport;
pub mod wire;

mod error;

// Re-export local types
pub use error::{ProtocolError, Result};
pub use identity::{DeviceIdentity, StaticIdentity};
pub use registry::{
    PeerEvent, PeerRecord, PeerRegistry, RegistryConfig, DEFAULT_ANNOUNCE_INTERVAL,
    DEFAULT_PEER_TIMEOUT,
};
pub use transfer::{
    ProgressTracker, SyncProgress, TransferConfig, TransferEngine, TransferEvent, TransferStatus,
    TransferSummary, DIRECT_CHUNK_SIZE, RELAY_CHUNK_SIZE,
};
pub use transport::{
    ChannelEvent, DirectChannel, FrameSink, Negotiator, NegotiatorConfig, RelayEvent, RelayLink,
    RelayLinkConfig, TransportManager, TransportType, DEFAULT_RECONNECT_DELAY,
};
pub use wire::{
    current_timestamp, Candidate, Decoded, PeerSummary, SessionDescription, SignalMessage,
    TransferFrame,
};

/// Wire protocol version; bumped when message shapes change incompatibly
pub const PROTOCOL_VERSION: u32 = 1;
