//! Store-and-forward file drop
//!
//! Uploaded files are written to disk under a random UUID and kept for a
//! fixed lifetime. A file is handed out exactly once: the first download
//! removes it. Expired files answer 410 to distinguish "was here, too late"
//! from plain 404.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// One stored upload.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_name: String,
    pub size: u64,
    pub path: PathBuf,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a retrieval attempt.
#[derive(Debug)]
pub enum Retrieval {
    /// The file is available; the entry has been removed
    Ready(StoredFile),
    /// The file existed but outlived its expiry
    Expired,
    /// No such file id
    Missing,
}

pub struct FileStore {
    dir: PathBuf,
    expiry: Duration,
    files: RwLock<HashMap<Uuid, StoredFile>>,
}

impl FileStore {
    pub fn new(dir: PathBuf, expiry: Duration) -> Self {
        Self {
            dir,
            expiry,
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Persist one upload from a byte stream without buffering it whole,
    /// returning its id and expiry time.
    pub async fn put_stream<R>(
        &self,
        file_name: String,
        mut reader: R,
    ) -> std::io::Result<(Uuid, StoredFile)>
    where
        R: AsyncRead + Unpin,
    {
        tokio::fs::create_dir_all(&self.dir).await?;

        let id = Uuid::new_v4();
        let path = self.dir.join(id.to_string());
        let mut file = tokio::fs::File::create(&path).await?;
        let size = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        let stored = StoredFile {
            file_name,
            size,
            path,
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.expiry)
                    .unwrap_or_else(|_| chrono::Duration::hours(24)),
        };

        debug!("Stored upload {} ({} bytes)", id, stored.size);
        self.files.write().await.insert(id, stored.clone());
        Ok((id, stored))
    }

    /// Persist one in-memory upload.
    pub async fn put(&self, file_name: String, bytes: &[u8]) -> std::io::Result<(Uuid, StoredFile)> {
        self.put_stream(file_name, bytes).await
    }

    /// Remove an entry and its on-disk file, if present.
    pub async fn discard(&self, id: Uuid) {
        if let Some(stored) = self.files.write().await.remove(&id) {
            let _ = tokio::fs::remove_file(&stored.path).await;
        }
    }

    /// Take a file out of the store. `Ready` means the caller now owns the
    /// only reference; the on-disk file is theirs to consume and delete.
    pub async fn take(&self, id: Uuid) -> Retrieval {
        let entry = self.files.write().await.remove(&id);
        match entry {
            Some(stored) if stored.expires_at <= Utc::now() => {
                let _ = tokio::fs::remove_file(&stored.path).await;
                debug!("Upload {} expired before download", id);
                Retrieval::Expired
            }
            Some(stored) => Retrieval::Ready(stored),
            None => Retrieval::Missing,
        }
    }

    /// Drop every expired entry and its file.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let expired: Vec<(Uuid, PathBuf)> = {
            let files = self.files.read().await;
            files
                .iter()
                .filter(|(_, stored)| stored.expires_at <= now)
                .map(|(id, stored)| (*id, stored.path.clone()))
                .collect()
        };

        for (id, path) in expired {
            warn!("Expiring undownloaded upload {}", id);
            self.files.write().await.remove(&id);
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_take_once() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf(), Duration::from_secs(60));

        let (id, stored) = store.put("a.txt".to_string(), b"hello").await.unwrap();
        assert_eq!(stored.size, 5);

        match store.take(id).await {
            Retrieval::Ready(file) => {
                assert_eq!(tokio::fs::read(&file.path).await.unwrap(), b"hello");
            }
            other => panic!("unexpected retrieval: {other:?}"),
        }

        // Second take: the entry is gone.
        assert!(matches!(store.take(id).await, Retrieval::Missing));
    }

    #[tokio::test]
    async fn test_discard_removes_entry_and_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf(), Duration::from_secs(60));

        let (id, stored) = store.put("a.txt".to_string(), b"hello").await.unwrap();
        store.discard(id).await;

        assert!(!stored.path.exists());
        assert!(matches!(store.take(id).await, Retrieval::Missing));
    }

    #[tokio::test]
    async fn test_expired_file_is_gone() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf(), Duration::ZERO);

        let (id, stored) = store.put("a.txt".to_string(), b"hello").await.unwrap();

        match store.take(id).await {
            Retrieval::Expired => assert!(!stored.path.exists()),
            other => panic!("unexpected retrieval: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf(), Duration::ZERO);

        let _ = store.put("a.txt".to_string(), b"x").await.unwrap();
        assert_eq!(store.len().await, 1);

        store.sweep().await;
        assert!(store.is_empty().await);
    }
}
