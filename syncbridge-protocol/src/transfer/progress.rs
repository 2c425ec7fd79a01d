//! Sync progress tracker
//!
//! Aggregates the session table into one owned snapshot after every chunk
//! completion. The walk is linear in the number of sessions, which is cheap
//! next to the I/O a chunk costs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::transfer::{TransferSession, TransferStatus, TransferSummary};

/// Aggregate view over all transfer sessions.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub total_files: u32,
    pub completed_files: u32,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// Sessions still in flight
    pub current_transfers: Vec<TransferSummary>,
}

/// Totals carried over from terminal sessions already evicted from the
/// table, so the aggregate keeps counting them.
#[derive(Debug, Clone, Default)]
struct RetiredTotals {
    files: u32,
    completed_files: u32,
    bytes: u64,
    transferred_bytes: u64,
}

/// Shared handle recomputing and serving [`SyncProgress`] snapshots.
#[derive(Clone)]
pub struct ProgressTracker {
    sessions: Arc<RwLock<HashMap<Uuid, TransferSession>>>,
    retired: Arc<RwLock<RetiredTotals>>,
    current: Arc<RwLock<SyncProgress>>,
}

impl ProgressTracker {
    pub fn new(sessions: Arc<RwLock<HashMap<Uuid, TransferSession>>>) -> Self {
        Self {
            sessions,
            retired: Arc::new(RwLock::new(RetiredTotals::default())),
            current: Arc::new(RwLock::new(SyncProgress::default())),
        }
    }

    /// Fold one evicted terminal session into the running totals.
    pub(crate) async fn absorb(&self, session: &TransferSession) {
        let mut retired = self.retired.write().await;
        retired.files += 1;
        retired.bytes += session.file_size;
        retired.transferred_bytes += if session.file_size > 0 {
            session.transferred_bytes.min(session.file_size)
        } else {
            session.transferred_bytes
        };
        if session.status == TransferStatus::Completed {
            retired.completed_files += 1;
        }
    }

    /// Rebuild the aggregate from the session table.
    pub async fn recompute(&self) {
        let mut progress = {
            let retired = self.retired.read().await;
            SyncProgress {
                total_files: retired.files,
                completed_files: retired.completed_files,
                total_bytes: retired.bytes,
                transferred_bytes: retired.transferred_bytes,
                current_transfers: Vec::new(),
            }
        };

        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            progress.total_files += 1;
            progress.total_bytes += session.file_size;
            progress.transferred_bytes += if session.file_size > 0 {
                session.transferred_bytes.min(session.file_size)
            } else {
                session.transferred_bytes
            };
            if session.status == TransferStatus::Completed {
                progress.completed_files += 1;
            }
            if !session.status.is_terminal() {
                progress.current_transfers.push(session.summary());
            }
        }
        drop(sessions);

        *self.current.write().await = progress;
    }

    /// Owned copy of the latest aggregate.
    pub async fn snapshot(&self) -> SyncProgress {
        self.current.read().await.clone()
    }
}
