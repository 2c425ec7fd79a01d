//! Transfer engine
//!
//! Owns the session table shared by the send and receive sides and drives
//! outgoing transfers: one task per session, `file-start` first, then chunks
//! in strictly increasing index order with per-chunk retries. Exhausting the
//! retries marks the session `Failed` and stops it; there is no partial
//! resume across restarts, a failed session is simply started again as a
//! new one.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::fs::File;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::transfer::chunker::{chunk_count, chunk_hash, read_chunk};
use crate::transfer::receiver::ReceivingFileState;
use crate::transfer::{
    ProgressTracker, TransferConfig, TransferDirection, TransferEvent, TransferSession,
    TransferStatus, TransferSummary,
};
use crate::transport::{FrameSink, TransportType};
use crate::wire::TransferFrame;
use crate::{ProtocolError, Result};

/// Chunked transfer engine, generic over the frame delivery seam.
pub struct TransferEngine<S: FrameSink> {
    pub(crate) sink: Arc<S>,
    pub(crate) config: TransferConfig,

    /// All sessions, both directions, keyed by file id
    pub(crate) sessions: Arc<RwLock<HashMap<Uuid, TransferSession>>>,

    /// Receive-side staging state, keyed by file id
    pub(crate) states: Arc<RwLock<HashMap<Uuid, ReceivingFileState>>>,

    pub(crate) progress: ProgressTracker,

    pub(crate) event_tx: mpsc::UnboundedSender<TransferEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl<S: FrameSink> TransferEngine<S> {
    pub fn new(sink: Arc<S>, config: TransferConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(RwLock::new(HashMap::new()));

        Arc::new(Self {
            sink,
            config,
            progress: ProgressTracker::new(Arc::clone(&sessions)),
            sessions,
            states: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
        })
    }

    /// Get a receiver for transfer events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
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

    /// Handle to the progress tracker backed by this engine's sessions.
    pub fn progress(&self) -> ProgressTracker {
        self.progress.clone()
    }

    /// Externally visible view of one session.
    pub async fn session(&self, file_id: Uuid) -> Option<TransferSummary> {
        self.sessions
            .read()
            .await
            .get(&file_id)
            .map(TransferSession::summary)
    }

    /// Spawn the inbound frame pump feeding the receive side.
    pub fn start_inbound(
        self: &Arc<Self>,
        mut frames: mpsc::UnboundedReceiver<(String, TransferFrame)>,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((peer_id, frame)) = frames.recv().await {
                engine.handle_frame(&peer_id, frame).await;
            }
        });
    }

    /// Start sending a file to a peer. Returns the session (= file) id
    /// immediately; delivery runs in its own task.
    ///
    /// The chunk size is fixed at this point by the transport the first
    /// frame would use, and stays fixed for the whole session.
    pub async fn send_file(self: &Arc<Self>, peer_id: &str, path: impl AsRef<Path>) -> Result<Uuid> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ProtocolError::TransferFailed(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ProtocolError::TransferFailed(format!("unusable file name: {}", path.display()))
            })?
            .to_string();

        let file_size = metadata.len();
        let chunk_size = match self.sink.active_transport(peer_id).await {
            TransportType::Direct => self.config.direct_chunk_size,
            TransportType::Relay => self.config.relay_chunk_size,
        };
        let total_chunks = chunk_count(file_size, chunk_size);
        let file_id = Uuid::new_v4();

        self.sessions.write().await.insert(
            file_id,
            TransferSession {
                id: file_id,
                file_name: file_name.clone(),
                file_path: Some(path.clone()),
                file_size,
                peer_id: peer_id.to_string(),
                direction: TransferDirection::Send,
                status: TransferStatus::Pending,
                chunk_count: total_chunks,
                completed_chunks: HashSet::new(),
                transferred_bytes: 0,
            },
        );
        self.progress.recompute().await;

        info!(
            "Sending {} ({} bytes, {} chunks) to {}",
            file_name, file_size, total_chunks, peer_id
        );

        let engine = Arc::clone(self);
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            engine
                .run_send(file_id, peer, path, file_name, file_size, chunk_size, total_chunks)
                .await;
        });

        Ok(file_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_send(
        self: Arc<Self>,
        file_id: Uuid,
        peer_id: String,
        path: PathBuf,
        file_name: String,
        file_size: u64,
        chunk_size: usize,
        total_chunks: u32,
    ) {
        self.set_status(file_id, TransferStatus::Transferring).await;
        if let Some(summary) = self.session(file_id).await {
            let _ = self.event_tx.send(TransferEvent::SendStarted { summary });
        }

        let start = TransferFrame::FileStart {
            file_id,
            file_name,
            file_size,
            total_chunks,
        };
        if let Err(e) = self.send_with_retry(&peer_id, &start).await {
            self.fail_send(file_id, format!("file-start not delivered: {e}"))
                .await;
            return;
        }

        if total_chunks == 0 {
            self.complete_send(file_id).await;
            return;
        }

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.fail_send(file_id, format!("cannot open {}: {e}", path.display()))
                    .await;
                return;
            }
        };

        for index in 0..total_chunks {
            let data = match read_chunk(&mut file, index, chunk_size, file_size).await {
                Ok(data) => data,
                Err(e) => {
                    self.fail_send(file_id, format!("chunk {index} read failed: {e}"))
                        .await;
                    return;
                }
            };

            let frame = TransferFrame::FileChunk {
                file_id,
                index,
                size: data.len() as u32,
                hash: chunk_hash(&data),
                total_chunks,
                data: BASE64.encode(&data),
            };
            let payload_len = data.len() as u64;
            // Payload is owned by the frame now; nothing else retains it.
            drop(data);

            if let Err(e) = self.send_with_retry(&peer_id, &frame).await {
                self.fail_send(file_id, format!("chunk {index} not delivered: {e}"))
                    .await;
                return;
            }

            {
                let mut sessions = self.sessions.write().await;
                if let Some(session) = sessions.get_mut(&file_id) {
                    session.completed_chunks.insert(index);
                    session.transferred_bytes += payload_len;
                }
            }
            self.progress.recompute().await;
        }

        self.complete_send(file_id).await;
    }

    /// Deliver one frame, retrying up to the configured attempt count with a
    /// fixed backoff in between.
    async fn send_with_retry(&self, peer_id: &str, frame: &TransferFrame) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.sink.send_frame(peer_id, frame).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_chunk_retries => {
                    warn!(
                        "Frame delivery to {} failed (attempt {}/{}): {}",
                        peer_id, attempt, self.config.max_chunk_retries, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn set_status(&self, file_id: Uuid, status: TransferStatus) {
        if let Some(session) = self.sessions.write().await.get_mut(&file_id) {
            session.status = status;
        }
    }

    async fn complete_send(self: &Arc<Self>, file_id: Uuid) {
        self.set_status(file_id, TransferStatus::Completed).await;
        self.progress.recompute().await;
        if let Some(summary) = self.session(file_id).await {
            info!("Transfer {} completed", file_id);
            let _ = self.event_tx.send(TransferEvent::SendCompleted { summary });
        }
        self.schedule_retirement(file_id);
    }

    async fn fail_send(self: &Arc<Self>, file_id: Uuid, reason: String) {
        warn!("Transfer {} failed: {}", file_id, reason);
        self.set_status(file_id, TransferStatus::Failed).await;
        self.progress.recompute().await;
        if let Some(summary) = self.session(file_id).await {
            let _ = self
                .event_tx
                .send(TransferEvent::SendFailed { summary, reason });
        }
        self.schedule_retirement(file_id);
    }

    /// Keep a finished session queryable for the retention window, then
    /// fold it into the aggregate totals and drop it from the table.
    pub(crate) fn schedule_retirement(self: &Arc<Self>, file_id: Uuid) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(engine.config.terminal_retention).await;
            engine.retire(file_id).await;
        });
    }

    async fn retire(&self, file_id: Uuid) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&file_id) {
                Some(session) if session.status.is_terminal() => sessions.remove(&file_id),
                _ => None,
            }
        };
        if let Some(session) = removed {
            self.progress.absorb(&session).await;
            self.progress.recompute().await;
        }
    }
}
