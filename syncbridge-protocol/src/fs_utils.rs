//! File system helpers for staging and assembly
//!
//! The transfer engine consumes the local filesystem capability through this
//! module: safe file creation, partial-file cleanup, and collision-free
//! download paths.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::Result;

/// Ensure the parent directory of `file_path` exists, creating it if needed.
pub async fn ensure_parent_dir(file_path: impl AsRef<Path>) -> Result<()> {
    if let Some(parent) = file_path.as_ref().parent() {
        if !parent.exists() {
            debug!("Creating parent directory: {}", parent.display());
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Create a file after making sure its parent directory exists.
pub async fn create_file_safe(path: impl AsRef<Path>) -> Result<fs::File> {
    let path = path.as_ref();
    ensure_parent_dir(path).await?;
    let file = fs::File::create(path).await?;
    Ok(file)
}

/// Write a buffer to an open file, flushing is the caller's responsibility.
pub async fn write_file_safe(file: &mut fs::File, data: &[u8]) -> Result<()> {
    file.write_all(data).await?;
    Ok(())
}

/// Best-effort removal of a partially written file. Logs, never fails.
pub async fn cleanup_partial_file(path: impl AsRef<Path>) {
    let path = path.as_ref();
    if path.exists() {
        if let Err(e) = fs::remove_file(path).await {
            warn!("Failed to clean up partial file {}: {}", path.display(), e);
        } else {
            debug!("Cleaned up partial file: {}", path.display());
        }
    }
}

/// Pick a destination path that does not collide with an existing file.
///
/// Appends ` (1)`, ` (2)`, ... before the extension until the name is free.
pub async fn unique_download_path(base_dir: impl AsRef<Path>, filename: &str) -> PathBuf {
    let base_dir = base_dir.as_ref();
    let mut path = base_dir.join(filename);

    if !path.exists() {
        return path;
    }

    let (name, ext) = match filename.rfind('.') {
        Some(dot) if dot > 0 => filename.split_at(dot),
        _ => (filename, ""),
    };

    for i in 1.. {
        path = base_dir.join(format!("{name} ({i}){ext}"));
        if !path.exists() {
            break;
        }
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_parent_dir_creates_nested() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("a/b/file.txt");

        ensure_parent_dir(&file_path).await.unwrap();

        assert!(file_path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_create_and_write() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("staging/chunk-0");

        let mut file = create_file_safe(&file_path).await.unwrap();
        write_file_safe(&mut file, b"payload").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(std::fs::read(&file_path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_unique_download_path_with_conflicts() {
        let temp = TempDir::new().unwrap();
        std::fs::File::create(temp.path().join("report.pdf")).unwrap();
        std::fs::File::create(temp.path().join("report (1).pdf")).unwrap();

        let path = unique_download_path(temp.path(), "report.pdf").await;

        assert_eq!(path, temp.path().join("report (2).pdf"));
    }

    #[tokio::test]
    async fn test_unique_download_path_no_conflict() {
        let temp = TempDir::new().unwrap();
        let path = unique_download_path(temp.path(), "notes.txt").await;
        assert_eq!(path, temp.path().join("notes.txt"));
    }

    #[tokio::test]
    async fn test_cleanup_partial_file_is_quiet_on_missing() {
        let temp = TempDir::new().unwrap();
        cleanup_partial_file(temp.path().join("missing")).await;
    }
}
