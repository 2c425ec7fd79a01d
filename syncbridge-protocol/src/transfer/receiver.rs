//! Receive side of the transfer engine
//!
//! Verified chunks are staged to `<staging>/<file_id>/chunk-<index>` and the
//! file is assembled in index order once every chunk has arrived. Chunks may
//! arrive in any order, before their `file-start`, and duplicated; a chunk
//! whose recomputed digest does not match its header is logged and discarded
//! without being counted. The sender's retry loop is the only corrective
//! path, the receiver never requests a retransmit.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fs_utils;
use crate::transfer::chunker::chunk_hash;
use crate::transfer::engine::TransferEngine;
use crate::transfer::{
    TransferDirection, TransferEvent, TransferSession, TransferStatus,
};
use crate::transport::FrameSink;
use crate::wire::TransferFrame;

/// Staging state for one incoming file. At most one exists per file id;
/// destroyed after successful assembly.
#[derive(Debug)]
pub(crate) struct ReceivingFileState {
    pub file_name: String,
    pub total_chunks: u32,
    pub received: HashSet<u32>,
    /// Peer the first frame came from; frames for this file id from anyone
    /// else are discarded
    pub source_peer_id: String,
    /// Set when the name was synthesized from a chunk; a late `file-start`
    /// replaces it
    pub placeholder_name: bool,
}

impl<S: FrameSink> TransferEngine<S> {
    /// Feed one inbound transfer frame.
    pub async fn handle_frame(self: &std::sync::Arc<Self>, peer_id: &str, frame: TransferFrame) {
        match frame {
            TransferFrame::FileStart {
                file_id,
                file_name,
                file_size,
                total_chunks,
            } => {
                self.handle_file_start(peer_id, file_id, file_name, file_size, total_chunks)
                    .await;
            }
            TransferFrame::FileChunk {
                file_id,
                index,
                size,
                hash,
                total_chunks,
                data,
            } => {
                self.handle_chunk(peer_id, file_id, index, size, &hash, total_chunks, &data)
                    .await;
            }
        }
    }

    async fn handle_file_start(
        self: &std::sync::Arc<Self>,
        peer_id: &str,
        file_id: Uuid,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    ) {
        // A descriptor arriving after the session already finished (assembly
        // from synthesized state) must not resurrect it.
        if let Some(session) = self.sessions.read().await.get(&file_id) {
            if session.status.is_terminal() {
                debug!("Late file-start for finished transfer {}", file_id);
                return;
            }
        }

        let complete = {
            let mut states = self.states.write().await;
            match states.get_mut(&file_id) {
                Some(state) => {
                    if state.source_peer_id != peer_id {
                        warn!(
                            "file-start for {} from {} but transfer belongs to {}",
                            file_id, peer_id, state.source_peer_id
                        );
                        return;
                    }
                    // Chunks got here first; upgrade the synthesized name.
                    if state.placeholder_name {
                        debug!(
                            "Late file-start for {}: {} replaces placeholder",
                            file_id, file_name
                        );
                        state.file_name = file_name.clone();
                        state.placeholder_name = false;
                    }
                    state.total_chunks = total_chunks;
                    state.received.len() as u32 >= total_chunks
                }
                None => {
                    states.insert(
                        file_id,
                        ReceivingFileState {
                            file_name: file_name.clone(),
                            total_chunks,
                            received: HashSet::new(),
                            source_peer_id: peer_id.to_string(),
                            placeholder_name: false,
                        },
                    );
                    total_chunks == 0
                }
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&file_id) {
                Some(session) => {
                    session.file_name = file_name.clone();
                    session.file_size = file_size;
                    session.chunk_count = total_chunks;
                }
                None => {
                    info!(
                        "Receiving {} ({} bytes, {} chunks) from {}",
                        file_name, file_size, total_chunks, peer_id
                    );
                    sessions.insert(
                        file_id,
                        TransferSession {
                            id: file_id,
                            file_name: file_name.clone(),
                            file_path: None,
                            file_size,
                            peer_id: peer_id.to_string(),
                            direction: TransferDirection::Receive,
                            status: TransferStatus::Transferring,
                            chunk_count: total_chunks,
                            completed_chunks: HashSet::new(),
                            transferred_bytes: 0,
                        },
                    );
                    let _ = self.event_tx.send(TransferEvent::ReceiveStarted {
                        file_id,
                        file_name,
                        peer_id: peer_id.to_string(),
                    });
                }
            }
        }
        self.progress.recompute().await;

        if complete {
            self.assemble(file_id).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_chunk(
        self: &std::sync::Arc<Self>,
        peer_id: &str,
        file_id: Uuid,
        index: u32,
        size: u32,
        hash: &str,
        total_chunks: u32,
        data: &str,
    ) {
        // Multi-relay fan-out can deliver a duplicate of the last chunk
        // after assembly already ran; it must not resurrect the session.
        if let Some(session) = self.sessions.read().await.get(&file_id) {
            if session.status.is_terminal() {
                debug!("Chunk {} for finished transfer {}", index, file_id);
                return;
            }
        }

        let bytes = match BASE64.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Chunk {} of {} has undecodable payload: {}", index, file_id, e);
                return;
            }
        };
        if bytes.len() != size as usize || chunk_hash(&bytes) != hash {
            warn!(
                "Integrity failure: file {} chunk {} rejected",
                file_id, index
            );
            return;
        }

        // First chunk may beat the descriptor; synthesize state from the
        // chunk's own fields with a placeholder name.
        let fresh = {
            let mut states = self.states.write().await;
            match states.get_mut(&file_id) {
                Some(state) => {
                    if state.source_peer_id != peer_id {
                        warn!(
                            "Chunk for {} from {} but transfer belongs to {}",
                            file_id, peer_id, state.source_peer_id
                        );
                        return;
                    }
                    if index >= state.total_chunks {
                        warn!(
                            "Chunk index {} out of range for {} ({} chunks)",
                            index, file_id, state.total_chunks
                        );
                        return;
                    }
                    if state.received.contains(&index) {
                        debug!("Duplicate chunk {} for {}", index, file_id);
                        return;
                    }
                    false
                }
                None => {
                    if index >= total_chunks {
                        warn!(
                            "Chunk index {} out of range for unknown file {} ({} chunks)",
                            index, file_id, total_chunks
                        );
                        return;
                    }
                    states.insert(
                        file_id,
                        ReceivingFileState {
                            file_name: format!("{file_id}.part"),
                            total_chunks,
                            received: HashSet::new(),
                            source_peer_id: peer_id.to_string(),
                            placeholder_name: true,
                        },
                    );
                    true
                }
            }
        };

        if fresh {
            info!(
                "Chunk for unknown file {} from {}; staging ahead of file-start",
                file_id, peer_id
            );
            self.sessions.write().await.insert(
                file_id,
                TransferSession {
                    id: file_id,
                    file_name: format!("{file_id}.part"),
                    file_path: None,
                    file_size: 0,
                    peer_id: peer_id.to_string(),
                    direction: TransferDirection::Receive,
                    status: TransferStatus::Transferring,
                    chunk_count: total_chunks,
                    completed_chunks: HashSet::new(),
                    transferred_bytes: 0,
                },
            );
            let _ = self.event_tx.send(TransferEvent::ReceiveStarted {
                file_id,
                file_name: format!("{file_id}.part"),
                peer_id: peer_id.to_string(),
            });
        }

        if let Err(e) = self.stage_chunk(file_id, index, &bytes).await {
            warn!("Staging chunk {} of {} failed: {}", index, file_id, e);
            return;
        }

        let complete = {
            let mut states = self.states.write().await;
            match states.get_mut(&file_id) {
                Some(state) => {
                    state.received.insert(index);
                    state.received.len() as u32 >= state.total_chunks
                }
                None => false,
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&file_id) {
                session.completed_chunks.insert(index);
                session.transferred_bytes += bytes.len() as u64;
            }
        }
        self.progress.recompute().await;

        if complete {
            self.assemble(file_id).await;
        }
    }

    async fn stage_chunk(&self, file_id: Uuid, index: u32, bytes: &[u8]) -> crate::Result<()> {
        let path = self
            .config
            .staging_dir
            .join(file_id.to_string())
            .join(format!("chunk-{index}"));
        let mut file = fs_utils::create_file_safe(&path).await?;
        fs_utils::write_file_safe(&mut file, bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Assemble a fully received file in index order, verify the byte count
    /// and clean up staging. An inconsistency preserves the staged chunks.
    async fn assemble(self: &std::sync::Arc<Self>, file_id: Uuid) {
        let (file_name, total_chunks) = {
            let states = self.states.read().await;
            match states.get(&file_id) {
                Some(state) => (state.file_name.clone(), state.total_chunks),
                None => return,
            }
        };

        let staging = self.config.staging_dir.join(file_id.to_string());
        let dest = fs_utils::unique_download_path(&self.config.download_dir, &file_name).await;

        let mut written: u64 = 0;
        let result: crate::Result<()> = async {
            let mut out = fs_utils::create_file_safe(&dest).await?;
            for index in 0..total_chunks {
                let chunk_path = staging.join(format!("chunk-{index}"));
                let bytes = tokio::fs::read(&chunk_path).await.map_err(|_| {
                    crate::ProtocolError::Assembly(format!(
                        "staged chunk {index} of {file_id} is missing"
                    ))
                })?;
                out.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            out.flush().await?;

            let final_len = tokio::fs::metadata(&dest).await?.len();
            if final_len != written {
                return Err(crate::ProtocolError::Assembly(format!(
                    "assembled {final_len} bytes, staged {written}"
                )));
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                self.states.write().await.remove(&file_id);
                {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.get_mut(&file_id) {
                        session.status = TransferStatus::Completed;
                        if session.file_size == 0 {
                            session.file_size = written;
                        }
                    }
                }
                self.progress.recompute().await;
                info!("Assembled {} as {}", file_id, dest.display());
                let _ = self.event_tx.send(TransferEvent::ReceiveCompleted {
                    file_id,
                    path: dest,
                });
                self.schedule_retirement(file_id);
            }
            Err(e) => {
                // Keep the staged chunks for diagnosis; only the partial
                // destination file is removed.
                warn!("Assembly of {} failed: {}", file_id, e);
                fs_utils::cleanup_partial_file(&dest).await;
                {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.get_mut(&file_id) {
                        session.status = TransferStatus::Failed;
                    }
                }
                self.progress.recompute().await;
                let _ = self.event_tx.send(TransferEvent::ReceiveFailed {
                    file_id,
                    reason: e.to_string(),
                });
                self.schedule_retirement(file_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::engine::tests::{test_config, MockSink};
    use crate::transfer::TransferConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine_with(dir: &TempDir) -> Arc<TransferEngine<MockSink>> {
        TransferEngine::new(MockSink::new(), test_config(dir))
    }

    fn start_frame(file_id: Uuid, name: &str, size: u64, total: u32) -> TransferFrame {
        TransferFrame::FileStart {
            file_id,
            file_name: name.to_string(),
            file_size: size,
            total_chunks: total,
        }
    }

    fn chunk_frame(file_id: Uuid, index: u32, total: u32, data: &[u8]) -> TransferFrame {
        TransferFrame::FileChunk {
            file_id,
            index,
            size: data.len() as u32,
            hash: chunk_hash(data),
            total_chunks: total,
            data: BASE64.encode(data),
        }
    }

    async fn assembled_path(config: &TransferConfig, name: &str) -> std::path::PathBuf {
        config.download_dir.join(name)
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_and_late_file_start() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();
        let data = b"0123456789"; // 3 chunks of 4

        engine
            .handle_frame("peer-a", chunk_frame(file_id, 1, 3, &data[4..8]))
            .await;
        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 3, &data[..4]))
            .await;
        engine
            .handle_frame("peer-a", start_frame(file_id, "notes.txt", 10, 3))
            .await;
        engine
            .handle_frame("peer-a", chunk_frame(file_id, 2, 3, &data[8..]))
            .await;

        let dest = assembled_path(&engine.config, "notes.txt").await;
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);

        let summary = engine.session(file_id).await.unwrap();
        assert_eq!(summary.status, TransferStatus::Completed);
        assert_eq!(summary.file_name, "notes.txt");
        assert_eq!(engine.progress().snapshot().await.completed_files, 1);

        // Staging is gone after a clean assembly.
        assert!(!engine
            .config
            .staging_dir
            .join(file_id.to_string())
            .exists());
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_discarded_and_resent_one_accepted() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();

        engine
            .handle_frame("peer-a", start_frame(file_id, "a.bin", 4, 1))
            .await;

        let mut corrupt = chunk_frame(file_id, 0, 1, b"abcd");
        if let TransferFrame::FileChunk { hash, .. } = &mut corrupt {
            *hash = "00".repeat(32);
        }
        engine.handle_frame("peer-a", corrupt).await;

        let summary = engine.session(file_id).await.unwrap();
        assert_eq!(summary.completed_chunks, 0);
        assert_eq!(summary.status, TransferStatus::Transferring);

        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 1, b"abcd"))
            .await;

        let summary = engine.session(file_id).await.unwrap();
        assert_eq!(summary.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_counts_once() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();

        engine
            .handle_frame("peer-a", start_frame(file_id, "b.bin", 8, 2))
            .await;
        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 2, b"aaaa"))
            .await;
        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 2, b"aaaa"))
            .await;

        let summary = engine.session(file_id).await.unwrap();
        assert_eq!(summary.completed_chunks, 1);
        assert_eq!(engine.progress().snapshot().await.transferred_bytes, 4);
    }

    #[tokio::test]
    async fn test_duplicate_of_final_chunk_after_assembly_is_ignored() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();

        engine
            .handle_frame("peer-a", start_frame(file_id, "done.bin", 4, 1))
            .await;
        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 1, b"abcd"))
            .await;
        assert_eq!(
            engine.session(file_id).await.unwrap().status,
            TransferStatus::Completed
        );

        // A second relay delivers the same final chunk after assembly.
        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 1, b"abcd"))
            .await;

        let summary = engine.session(file_id).await.unwrap();
        assert_eq!(summary.status, TransferStatus::Completed);
        assert!(!assembled_path(&engine.config, &format!("{file_id}.part"))
            .await
            .exists());
        assert!(!engine
            .config
            .staging_dir
            .join(file_id.to_string())
            .exists());
        assert_eq!(engine.progress().snapshot().await.completed_files, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_chunk_before_file_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();

        engine
            .handle_frame("peer-a", chunk_frame(file_id, 5, 3, b"stray"))
            .await;

        assert!(engine.session(file_id).await.is_none());
        assert!(!engine
            .config
            .staging_dir
            .join(file_id.to_string())
            .exists());
        assert_eq!(engine.progress().snapshot().await.completed_files, 0);
    }

    #[tokio::test]
    async fn test_chunk_from_wrong_peer_is_discarded() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();

        engine
            .handle_frame("peer-a", start_frame(file_id, "c.bin", 8, 2))
            .await;
        engine
            .handle_frame("peer-x", chunk_frame(file_id, 0, 2, b"evil"))
            .await;

        let summary = engine.session(file_id).await.unwrap();
        assert_eq!(summary.completed_chunks, 0);

        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 2, b"good"))
            .await;
        assert_eq!(engine.session(file_id).await.unwrap().completed_chunks, 1);
    }

    #[tokio::test]
    async fn test_empty_file_completes_on_file_start() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();

        engine
            .handle_frame("peer-a", start_frame(file_id, "empty.txt", 0, 0))
            .await;

        let dest = assembled_path(&engine.config, "empty.txt").await;
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"");
        assert_eq!(
            engine.session(file_id).await.unwrap().status,
            TransferStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_placeholder_name_without_file_start() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir);
        let file_id = Uuid::new_v4();

        engine
            .handle_frame("peer-a", chunk_frame(file_id, 0, 1, b"data"))
            .await;

        let dest = assembled_path(&engine.config, &format!("{file_id}.part")).await;
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"data");
    }
}
