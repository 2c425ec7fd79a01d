//! HTTP side channel
//!
//! Health and peer inspection, plus the store-and-forward file drop:
//! `POST /upload` streams raw bytes to disk with `X-File-Name`/`X-File-Size`
//! headers, `GET /download/{fileId}` streams the file back exactly once.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;
use uuid::Uuid;

use syncbridge_protocol::PeerSummary;

use crate::store::Retrieval;
use crate::RelayState;

pub(crate) async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connectedPeers": state.connected_peers().await,
        "uptime": state.uptime().as_secs(),
    }))
}

pub(crate) async fn peers(State(state): State<Arc<RelayState>>) -> Json<Vec<PeerSummary>> {
    Json(state.peer_summaries().await)
}

pub(crate) async fn upload(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let file_name = headers
        .get("x-file-name")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("upload.bin")
        .to_string();

    let declared = headers
        .get("x-file-size")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    // Stream straight to disk; uploads can be arbitrarily large.
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(stream);

    let (file_id, stored) = state
        .store
        .put_stream(file_name, &mut reader)
        .await
        .map_err(|e| {
            warn!("Failed to store upload: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if let Some(declared) = declared {
        if declared != stored.size {
            warn!(
                "Upload '{}' declared {} bytes but carried {}",
                stored.file_name, declared, stored.size
            );
            state.store.discard(file_id).await;
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    Ok(Json(json!({
        "fileId": file_id,
        "filename": stored.file_name,
        "size": stored.size,
        "expiresAt": stored.expires_at.timestamp_millis(),
    })))
}

pub(crate) async fn download(
    State(state): State<Arc<RelayState>>,
    Path(file_id): Path<Uuid>,
) -> Response {
    let stored = match state.store.take(file_id).await {
        Retrieval::Ready(stored) => stored,
        Retrieval::Expired => return StatusCode::GONE.into_response(),
        Retrieval::Missing => return StatusCode::NOT_FOUND.into_response(),
    };

    let file = match tokio::fs::File::open(&stored.path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Stored file {} unreadable: {}", file_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Unlink now; the open handle keeps the bytes alive for this stream.
    let _ = tokio::fs::remove_file(&stored.path).await;

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, stored.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", stored.file_name),
        )
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
