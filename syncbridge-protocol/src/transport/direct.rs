//! Direct peer-to-peer channel
//!
//! A negotiated TCP connection carrying newline-delimited JSON. The first
//! line in each direction is a `hello` identifying the sending device; every
//! line after that is a [`TransferFrame`]. Either side closing the socket
//! tears the channel down, and the owner falls back to the relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::TransferFrame;
use crate::{ProtocolError, Result};

/// How long to wait for the peer's `hello` line
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-channel ids. Both sides of an accept/connect race can produce a
/// channel to the same peer; the id tells the owner which one a close
/// notification belongs to.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// First line exchanged on a fresh direct connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "hello", rename_all = "camelCase")]
struct Hello {
    device_id: String,
}

/// An established direct channel to one peer.
///
/// Dropping the handle closes the outbound side; the reader task then winds
/// down when the peer closes theirs.
#[derive(Debug)]
pub struct DirectChannel {
    id: u64,
    peer_id: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl DirectChannel {
    /// Run the hello handshake on a fresh connection and spawn the channel's
    /// reader and writer tasks.
    ///
    /// Inbound frames go to `frames` tagged with the peer id; `closed`
    /// receives the peer id and the channel id once when the channel dies.
    ///
    /// # Errors
    ///
    /// Fails if the handshake cannot be completed within
    /// [`HANDSHAKE_TIMEOUT`] or the peer's first line is not a `hello`.
    pub async fn establish(
        stream: TcpStream,
        local_id: &str,
        frames: mpsc::UnboundedSender<(String, TransferFrame)>,
        closed: mpsc::UnboundedSender<(String, u64)>,
    ) -> Result<Self> {
        // Frames are small; latency matters more than throughput here.
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = serde_json::to_string(&Hello {
            device_id: local_id.to_string(),
        })?;
        write_half.write_all(hello.as_bytes()).await?;
        write_half.write_all(b"\n").await?;

        let mut line = String::new();
        let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| ProtocolError::Timeout("direct channel handshake".to_string()))??;
        if read == 0 {
            return Err(ProtocolError::Transport(
                "peer closed connection during handshake".to_string(),
            ));
        }

        let peer_hello: Hello = serde_json::from_str(line.trim())
            .map_err(|e| ProtocolError::InvalidMessage(format!("bad hello line: {e}")))?;
        let peer_id = peer_hello.device_id;
        debug!("Direct channel handshake complete with {}", peer_id);

        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_reader(reader, id, peer_id.clone(), frames, closed));
        tokio::spawn(run_writer(write_half, out_rx));

        Ok(Self {
            id,
            peer_id,
            outbound: out_tx,
        })
    }

    /// This channel's id, unique across the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The remote device id learned during the handshake.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Queue one frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the channel has already shut down.
    pub fn send(&self, frame: &TransferFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(text)
            .map_err(|_| ProtocolError::Transport("direct channel closed".to_string()))
    }
}

async fn run_reader(
    mut reader: BufReader<OwnedReadHalf>,
    channel_id: u64,
    peer_id: String,
    frames: mpsc::UnboundedSender<(String, TransferFrame)>,
    closed: mpsc::UnboundedSender<(String, u64)>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TransferFrame>(trimmed) {
                    Ok(frame) => {
                        if frames.send((peer_id.clone(), frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame from {}: {}", peer_id, e),
                }
            }
            Err(e) => {
                warn!("Direct channel read from {} failed: {}", peer_id, e);
                break;
            }
        }
    }
    debug!("Direct channel to {} closed", peer_id);
    let _ = closed.send((peer_id, channel_id));
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = out_rx.recv().await {
        if write_half.write_all(text.as_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
