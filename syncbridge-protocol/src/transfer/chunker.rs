//! Chunk arithmetic and integrity hashing
//!
//! Chunk size is fixed per session when the session starts, chosen by the
//! transport the first frame would use. The values are tunables, not
//! protocol constants: the chunk header carries everything a receiver needs.

use std::io::SeekFrom;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{ProtocolError, Result};

/// Chunk size for sessions starting on the relay path (16 KiB)
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

/// Chunk size for sessions starting on a direct channel (64 KiB)
pub const DIRECT_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks a file of `file_size` bytes splits into.
///
/// An empty file has zero chunks; its session completes on the descriptor
/// alone.
pub fn chunk_count(file_size: u64, chunk_size: usize) -> u32 {
    if file_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size as u64) as u32
}

/// Hex-encoded SHA-256 digest of one chunk payload.
pub fn chunk_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Read the byte range of chunk `index` from an open file.
pub async fn read_chunk(
    file: &mut File,
    index: u32,
    chunk_size: usize,
    file_size: u64,
) -> Result<Vec<u8>> {
    let offset = index as u64 * chunk_size as u64;
    if offset >= file_size {
        return Err(ProtocolError::TransferFailed(format!(
            "chunk {index} is beyond the end of the file"
        )));
    }

    let len = chunk_size.min((file_size - offset) as usize);
    let mut buffer = vec![0u8; len];

    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}
