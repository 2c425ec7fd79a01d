//! WebSocket message bus
//!
//! One socket per peer. The first `peer-announce` registers the connection;
//! from then on the relay routes addressed messages, answers peer-list
//! requests and broadcasts presence changes. Messages with a type the relay
//! does not know are broadcast to every other peer unchanged, so older
//! clients keep working.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use syncbridge_protocol::wire::decode;
use syncbridge_protocol::{Decoded, PeerSummary, SignalMessage};

use crate::RelayState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let conn_id = state.next_conn_id();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    debug!("Socket {} connected", conn_id);

    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Device id this socket announced as, once it has
    let mut registered: Option<String> = None;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("Socket {} read error: {}", conn_id, e);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_text(&state, conn_id, &tx, &mut registered, text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(device_id) = registered {
        state.unregister(conn_id, &device_id).await;
    }
    debug!("Socket {} closed", conn_id);
}

async fn handle_text(
    state: &Arc<RelayState>,
    conn_id: u64,
    tx: &mpsc::UnboundedSender<String>,
    registered: &mut Option<String>,
    text: String,
) {
    match decode(&text) {
        Ok(Decoded::Known(message)) => match &message {
            SignalMessage::PeerAnnounce {
                device_id,
                device_name,
                ip,
                port,
                timestamp,
            } => {
                let summary = PeerSummary {
                    device_id: device_id.clone(),
                    device_name: device_name.clone(),
                    ip: ip.clone(),
                    port: *port,
                    timestamp: *timestamp,
                };
                state.register(conn_id, tx.clone(), summary, &text).await;
                *registered = Some(device_id.clone());
            }
            SignalMessage::PeerListRequest { device_id } => {
                state.touch(device_id).await;
                state.send_peer_list(device_id, tx).await;
            }
            SignalMessage::PeerDisconnect { device_id } => {
                if registered.as_deref() == Some(device_id.as_str()) {
                    state.unregister(conn_id, device_id).await;
                    *registered = None;
                }
            }
            SignalMessage::PeerList { .. } => {
                debug!("Ignoring peer-list sent by a client");
            }
            addressed => {
                if let Some(from) = addressed.sender() {
                    state.touch(from).await;
                }
                match addressed.addressed_to() {
                    Some(to) => state.route(to, &text).await,
                    None => debug!("Ignoring unroutable message on socket {}", conn_id),
                }
            }
        },
        Ok(Decoded::Unrecognized(value)) => {
            // Legacy message kinds pass through to everyone else.
            debug!(
                "Broadcasting unrecognized message kind {}",
                value.get("type").and_then(|t| t.as_str()).unwrap_or("?")
            );
            let exclude = registered.as_deref().unwrap_or("");
            state.broadcast_except(exclude, &text).await;
        }
        Err(e) => {
            warn!("Dropping malformed message on socket {}: {}", conn_id, e);
        }
    }
}
