//! Peer Registry Event System
//!
//! This module defines events emitted by the peer registry.

use super::PeerRecord;

/// Events emitted by the peer registry
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer was seen for the first time.
    ///
    /// Emitted exactly once per peer id while the peer stays known; repeated
    /// announcements only refresh `last_seen`.
    Discovered {
        /// The newly created registry record
        record: PeerRecord,
    },

    /// A known peer went away, either through an explicit disconnect or
    /// after the liveness timeout.
    Lost {
        /// The record as it was at removal time
        record: PeerRecord,
    },
}
