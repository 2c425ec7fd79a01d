//! Chunked file transfer engine
//!
//! Files travel as a `file-start` descriptor followed by fixed-size chunks,
//! each carrying its own SHA-256 digest. The send side drives one task per
//! session with per-chunk retries; the receive side stages verified chunks
//! on disk and assembles the file once every index has arrived. Both sides
//! share one session table, which the progress tracker reads to build its
//! aggregate snapshot.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

pub mod chunker;
pub mod engine;
pub mod progress;
pub mod receiver;

pub use chunker::{DIRECT_CHUNK_SIZE, RELAY_CHUNK_SIZE};
pub use engine::TransferEngine;
pub use progress::{ProgressTracker, SyncProgress};

/// Default number of delivery attempts per chunk
pub const DEFAULT_CHUNK_RETRIES: u32 = 3;

/// Default pause between chunk delivery attempts
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Default time a finished session stays queryable before it is folded
/// into the aggregate totals and dropped from the session table
pub const DEFAULT_TERMINAL_RETENTION: Duration = Duration::from_secs(300);

/// Lifecycle states of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Created, no frame sent yet
    Pending,
    /// Frames in flight
    Transferring,
    /// All chunks delivered / file assembled
    Completed,
    /// Retries exhausted or assembly failed; terminal
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// Which way a session moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Send,
    Receive,
}

/// One transfer session, send or receive side.
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Session id, identical to the file id on the wire
    pub id: Uuid,
    pub file_name: String,
    /// Source path for send sessions, `None` while receiving
    pub file_path: Option<PathBuf>,
    /// Total size in bytes; `0` until a receive session learns it
    pub file_size: u64,
    pub peer_id: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub chunk_count: u32,
    /// Indices delivered (send) or staged (receive) so far
    pub completed_chunks: HashSet<u32>,
    /// Payload bytes moved so far
    pub transferred_bytes: u64,
}

impl TransferSession {
    pub fn summary(&self) -> TransferSummary {
        let progress_percent = if self.file_size > 0 {
            (self.transferred_bytes as f64 / self.file_size as f64) * 100.0
        } else if self.status == TransferStatus::Completed {
            100.0
        } else {
            0.0
        };

        TransferSummary {
            id: self.id,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            peer_id: self.peer_id.clone(),
            direction: self.direction,
            status: self.status,
            chunk_count: self.chunk_count,
            completed_chunks: self.completed_chunks.len() as u32,
            progress_percent,
        }
    }
}

/// Owned, externally visible view of one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub peer_id: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub chunk_count: u32,
    pub completed_chunks: u32,
    pub progress_percent: f64,
}

/// Transfer engine configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunk size used when a session starts on the relay path
    pub relay_chunk_size: usize,

    /// Chunk size used when a session starts on a direct channel
    pub direct_chunk_size: usize,

    /// Delivery attempts per chunk before the session fails
    pub max_chunk_retries: u32,

    /// Pause between delivery attempts
    pub retry_backoff: Duration,

    /// Directory for staged chunks of incoming files
    pub staging_dir: PathBuf,

    /// Directory assembled files land in
    pub download_dir: PathBuf,

    /// How long Completed/Failed sessions stay in the table before
    /// eviction; their totals survive in the aggregate snapshot
    pub terminal_retention: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("syncbridge");
        Self {
            relay_chunk_size: RELAY_CHUNK_SIZE,
            direct_chunk_size: DIRECT_CHUNK_SIZE,
            max_chunk_retries: DEFAULT_CHUNK_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            staging_dir: base.join("staging"),
            download_dir: base.join("downloads"),
            terminal_retention: DEFAULT_TERMINAL_RETENTION,
        }
    }
}

/// Events emitted by the transfer engine
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// An outgoing session started sending frames
    SendStarted { summary: TransferSummary },

    /// An outgoing session delivered every chunk
    SendCompleted { summary: TransferSummary },

    /// An outgoing session gave up after exhausting retries
    SendFailed {
        summary: TransferSummary,
        reason: String,
    },

    /// A `file-start` (or first chunk) arrived for a new incoming file
    ReceiveStarted {
        file_id: Uuid,
        file_name: String,
        peer_id: String,
    },

    /// An incoming file was fully assembled
    ReceiveCompleted { file_id: Uuid, path: PathBuf },

    /// An incoming file could not be assembled; staging is preserved
    ReceiveFailed { file_id: Uuid, reason: String },
}
