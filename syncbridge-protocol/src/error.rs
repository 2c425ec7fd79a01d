//! Error handling for the syncbridge protocol
//!
//! All protocol operations return [`Result`], a type alias over
//! [`ProtocolError`]. Underlying library errors (I/O, JSON, WebSocket)
//! convert automatically via `thiserror`'s `#[from]`.

use thiserror::Error;
use uuid::Uuid;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error on the relay message channel
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid or malformed wire message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Peer not present in the registry or not reachable
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Transport layer error (relay channel down, direct channel closed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A chunk's recomputed digest did not match the declared one
    #[error("Integrity failure: file {file_id} chunk {index}")]
    Integrity { file_id: Uuid, index: u32 },

    /// A transfer session reached the failed state
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Reassembly detected inconsistent staging data
    #[error("Assembly error: {0}")]
    Assembly(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Check if this error is transient and might succeed on retry.
    ///
    /// Connectivity errors are recovered locally (reconnect loops, transport
    /// fallback) and are never surfaced as fatal; integrity and assembly
    /// errors are permanent for the affected chunk or session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::WebSocket(_)
                | ProtocolError::Transport(_)
                | ProtocolError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::PeerNotFound("device-123".to_string());
        assert_eq!(error.to_string(), "Peer not found: device-123");

        let error = ProtocolError::Transport("channel closed".to_string());
        assert_eq!(error.to_string(), "Transport error: channel closed");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.is_recoverable());
    }

    #[test]
    fn test_recoverability() {
        assert!(ProtocolError::Timeout("negotiation".to_string()).is_recoverable());
        assert!(!ProtocolError::Integrity {
            file_id: Uuid::nil(),
            index: 3
        }
        .is_recoverable());
        assert!(!ProtocolError::Assembly("missing chunk".to_string()).is_recoverable());
    }
}
