//! End-to-end tests over a real relay instance.
//!
//! Each test spins up the relay on an ephemeral port and drives it with the
//! protocol crate's own client components or raw WebSocket connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use syncbridge_protocol::{
    FrameSink, NegotiatorConfig, PeerEvent, PeerRegistry, RegistryConfig, RelayLink,
    RelayLinkConfig, StaticIdentity, TransferConfig, TransferEngine, TransferEvent, TransferFrame,
    TransportManager, TransportType,
};
use syncbridge_relay::{spawn, RelayConfig, RelayState};

struct TestRelay {
    url: String,
    addr: SocketAddr,
    state: Arc<RelayState>,
    _store_dir: TempDir,
}

async fn start_relay(upload_expiry: Duration) -> TestRelay {
    let store_dir = TempDir::new().unwrap();
    let config = RelayConfig {
        upload_expiry,
        store_dir: store_dir.path().to_path_buf(),
        ..Default::default()
    };
    let (addr, state, _handle) = spawn("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();

    TestRelay {
        url: format!("ws://{addr}/ws"),
        addr,
        state,
        _store_dir: store_dir,
    }
}

fn link(url: &str, id: &str, name: &str) -> Arc<RelayLink> {
    let identity = StaticIdentity::new(id, name);
    let link = RelayLink::new(
        vec![url.to_string()],
        &identity,
        RelayLinkConfig {
            reconnect_delay: Duration::from_millis(200),
            ..Default::default()
        },
    );
    link.start();
    link
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_peers_discover_each_other() {
    let relay = start_relay(Duration::from_secs(60)).await;

    let link_a = link(&relay.url, "dev-a", "Alpha");
    let link_b = link(&relay.url, "dev-b", "Beta");

    let registry_a = PeerRegistry::new(Arc::clone(&link_a), RegistryConfig::default());
    let registry_b = PeerRegistry::new(Arc::clone(&link_b), RegistryConfig::default());
    let mut events_b = registry_b.subscribe().await;
    registry_a.start();
    registry_b.start();

    // B hears about A, either from the broadcast announce or the peer list.
    let discovered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(PeerEvent::Discovered { record }) = events_b.recv().await {
                if record.id == "dev-a" {
                    return record;
                }
            }
        }
    })
    .await
    .expect("dev-b never discovered dev-a");
    assert_eq!(discovered.display_name, "Alpha");

    wait_for("registry_a to know dev-b", || async {
        registry_a.get_peer("dev-b").await.is_some()
    })
    .await;

    assert_eq!(relay.state.connected_peers().await, 2);
}

fn transfer_config(dir: &TempDir) -> TransferConfig {
    TransferConfig {
        relay_chunk_size: 4,
        direct_chunk_size: 8,
        retry_backoff: Duration::from_millis(50),
        staging_dir: dir.path().join("staging"),
        download_dir: dir.path().join("downloads"),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_three_chunk_transfer_over_relay() {
    let relay = start_relay(Duration::from_secs(60)).await;
    let dir = TempDir::new().unwrap();

    let manager_a = TransportManager::new(link(&relay.url, "dev-a", "Alpha"), NegotiatorConfig::default());
    let manager_b = TransportManager::new(link(&relay.url, "dev-b", "Beta"), NegotiatorConfig::default());
    manager_a.start();
    manager_b.start();

    let engine_a = TransferEngine::new(Arc::clone(&manager_a), transfer_config(&dir));
    let engine_b = TransferEngine::new(Arc::clone(&manager_b), transfer_config(&dir));
    engine_b.start_inbound(manager_b.take_frames().unwrap());
    let mut events_b = engine_b.subscribe().await;

    let state = Arc::clone(&relay.state);
    wait_for("both peers to register", || {
        let state = Arc::clone(&state);
        async move { state.connected_peers().await == 2 }
    })
    .await;

    let data = b"0123456789"; // 3 chunks of 4 bytes
    let source = dir.path().join("payload.bin");
    tokio::fs::write(&source, data).await.unwrap();

    engine_a.send_file("dev-b", &source).await.unwrap();

    let received_path = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(TransferEvent::ReceiveCompleted { path, .. }) = events_b.recv().await {
                return path;
            }
        }
    })
    .await
    .expect("transfer never completed");

    assert_eq!(tokio::fs::read(&received_path).await.unwrap(), data);
    assert_eq!(engine_b.progress().snapshot().await.completed_files, 1);
}

/// Frame sink that fails the first N chunk sends, then delegates to the real
/// transport manager.
struct FlakySink {
    inner: Arc<TransportManager>,
    failures_left: AtomicUsize,
}

impl FrameSink for FlakySink {
    async fn send_frame(&self, peer_id: &str, frame: &TransferFrame) -> syncbridge_protocol::Result<()> {
        if frame.carries_payload() {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(syncbridge_protocol::ProtocolError::Transport(
                    "injected failure".to_string(),
                ));
            }
        }
        self.inner.send_frame(peer_id, frame).await
    }

    async fn active_transport(&self, peer_id: &str) -> TransportType {
        self.inner.active_transport(peer_id).await
    }
}

#[tokio::test]
async fn test_injected_send_failure_is_retried_to_completion() {
    let relay = start_relay(Duration::from_secs(60)).await;
    let dir = TempDir::new().unwrap();

    let manager_a = TransportManager::new(link(&relay.url, "dev-a", "Alpha"), NegotiatorConfig::default());
    let manager_b = TransportManager::new(link(&relay.url, "dev-b", "Beta"), NegotiatorConfig::default());
    manager_a.start();
    manager_b.start();

    let flaky = Arc::new(FlakySink {
        inner: Arc::clone(&manager_a),
        failures_left: AtomicUsize::new(1),
    });
    let engine_a = TransferEngine::new(flaky, transfer_config(&dir));
    let engine_b = TransferEngine::new(Arc::clone(&manager_b), transfer_config(&dir));
    engine_b.start_inbound(manager_b.take_frames().unwrap());
    let mut events_b = engine_b.subscribe().await;

    let state = Arc::clone(&relay.state);
    wait_for("both peers to register", || {
        let state = Arc::clone(&state);
        async move { state.connected_peers().await == 2 }
    })
    .await;

    let data = b"retryable payload";
    let source = dir.path().join("payload.bin");
    tokio::fs::write(&source, data).await.unwrap();

    let id = engine_a.send_file("dev-b", &source).await.unwrap();

    let received_path = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(TransferEvent::ReceiveCompleted { path, .. }) = events_b.recv().await {
                return path;
            }
        }
    })
    .await
    .expect("transfer with injected failure never completed");

    assert_eq!(tokio::fs::read(&received_path).await.unwrap(), data);
    assert_eq!(
        engine_a.session(id).await.unwrap().status,
        syncbridge_protocol::TransferStatus::Completed
    );
}

#[tokio::test]
async fn test_direct_channel_upgrade_with_injected_chunk_failure() {
    let relay = start_relay(Duration::from_secs(60)).await;
    let dir = TempDir::new().unwrap();

    let manager_a = TransportManager::new(link(&relay.url, "dev-a", "Alpha"), NegotiatorConfig::default());
    let manager_b = TransportManager::new(link(&relay.url, "dev-b", "Beta"), NegotiatorConfig::default());
    manager_a.start();
    manager_b.start();

    let flaky = Arc::new(FlakySink {
        inner: Arc::clone(&manager_a),
        failures_left: AtomicUsize::new(1),
    });
    let engine_a = TransferEngine::new(flaky, transfer_config(&dir));
    let engine_b = TransferEngine::new(Arc::clone(&manager_b), transfer_config(&dir));
    engine_b.start_inbound(manager_b.take_frames().unwrap());
    let mut events_b = engine_b.subscribe().await;

    let state = Arc::clone(&relay.state);
    wait_for("both peers to register", || {
        let state = Arc::clone(&state);
        async move { state.connected_peers().await == 2 }
    })
    .await;

    // Negotiate the upgrade over the relay; both sides run on localhost so
    // the loopback candidate always connects.
    manager_a.connect_direct("dev-b").await.unwrap();
    assert!(
        manager_a.wait_for_direct("dev-b", Duration::from_secs(8)).await,
        "direct channel never came up"
    );
    assert_eq!(
        manager_a.active_transport("dev-b").await,
        TransportType::Direct
    );

    let data = b"0123456789abcdef+tail"; // 3 chunks at the direct chunk size
    let source = dir.path().join("payload.bin");
    tokio::fs::write(&source, data).await.unwrap();

    let id = engine_a.send_file("dev-b", &source).await.unwrap();

    let received_path = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(TransferEvent::ReceiveCompleted { path, .. }) = events_b.recv().await {
                return path;
            }
        }
    })
    .await
    .expect("direct-path transfer never completed");

    assert_eq!(tokio::fs::read(&received_path).await.unwrap(), data);
    assert_eq!(
        engine_a.session(id).await.unwrap().status,
        syncbridge_protocol::TransferStatus::Completed
    );
}

#[tokio::test]
async fn test_message_to_unknown_peer_is_dropped_not_broadcast() {
    let relay = start_relay(Duration::from_secs(60)).await;

    let (stream_a, _) = connect_async(relay.url.as_str()).await.unwrap();
    let (mut sink_a, mut read_a) = stream_a.split();
    let (stream_b, _) = connect_async(relay.url.as_str()).await.unwrap();
    let (mut sink_b, mut read_b) = stream_b.split();

    let announce = |id: &str| {
        format!(
            r#"{{"type":"peer-announce","deviceId":"{id}","deviceName":"{id}","ip":"unknown","port":0,"timestamp":1}}"#
        )
    };
    sink_a.send(Message::text(announce("a"))).await.unwrap();
    sink_b.send(Message::text(announce("b"))).await.unwrap();

    // Drain the replies each side gets on registration (peer list and,
    // depending on ordering, the other's announce broadcast).
    for _ in 0..2 {
        let _ = tokio::time::timeout(Duration::from_millis(500), read_a.next()).await;
        let _ = tokio::time::timeout(Duration::from_millis(500), read_b.next()).await;
    }

    sink_a
        .send(Message::text(
            r#"{"type":"peer-message","from":"a","to":"ghost","message":{"x":1}}"#.to_string(),
        ))
        .await
        .unwrap();

    // Neither a nor b may see the addressed message.
    let got_b = tokio::time::timeout(Duration::from_millis(500), read_b.next()).await;
    assert!(
        got_b.is_err(),
        "message to unknown peer leaked to another client: {got_b:?}"
    );

    // An unknown *type* on the other hand is broadcast.
    sink_a
        .send(Message::text(
            r#"{"type":"legacy-ping","deviceId":"a"}"#.to_string(),
        ))
        .await
        .unwrap();
    let legacy = tokio::time::timeout(Duration::from_secs(2), read_b.next())
        .await
        .expect("legacy broadcast not delivered")
        .unwrap()
        .unwrap();
    match legacy {
        Message::Text(text) => assert!(text.as_str().contains("legacy-ping")),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_download_once_then_404() {
    let relay = start_relay(Duration::from_secs(60)).await;
    let base = format!("http://{}", relay.addr);
    let client = reqwest::Client::new();

    let body = b"store and forward".to_vec();
    let upload: serde_json::Value = client
        .post(format!("{base}/upload"))
        .header("X-File-Name", "note.txt")
        .header("X-File-Size", body.len().to_string())
        .body(body.clone())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let file_id = upload["fileId"].as_str().unwrap().to_string();
    assert_eq!(upload["filename"], "note.txt");
    assert_eq!(upload["size"], body.len() as u64);

    let first = client
        .get(format!("{base}/download/{file_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    assert_eq!(first.bytes().await.unwrap().to_vec(), body);

    let second = client
        .get(format!("{base}/download/{file_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_multi_megabyte_upload_streams_through() {
    let relay = start_relay(Duration::from_secs(60)).await;
    let base = format!("http://{}", relay.addr);
    let client = reqwest::Client::new();

    // Well past axum's default 2 MiB body cap.
    let body: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let upload: serde_json::Value = client
        .post(format!("{base}/upload"))
        .header("X-File-Name", "big.bin")
        .header("X-File-Size", body.len().to_string())
        .body(body.clone())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(upload["size"], body.len() as u64);

    let file_id = upload["fileId"].as_str().unwrap().to_string();
    let response = client
        .get(format!("{base}/download/{file_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().to_vec(), body);
}

#[tokio::test]
async fn test_expired_upload_answers_410() {
    let relay = start_relay(Duration::ZERO).await;
    let base = format!("http://{}", relay.addr);
    let client = reqwest::Client::new();

    let upload: serde_json::Value = client
        .post(format!("{base}/upload"))
        .header("X-File-Name", "late.txt")
        .body(b"too late".to_vec())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let file_id = upload["fileId"].as_str().unwrap();

    let response = client
        .get(format!("{base}/download/{file_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::GONE);
}

#[tokio::test]
async fn test_health_reports_connected_peers() {
    let relay = start_relay(Duration::from_secs(60)).await;
    let _link = link(&relay.url, "dev-a", "Alpha");

    let state = Arc::clone(&relay.state);
    wait_for("peer to register", || {
        let state = Arc::clone(&state);
        async move { state.connected_peers().await == 1 }
    })
    .await;

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", relay.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connectedPeers"], 1);

    let peers: serde_json::Value = reqwest::get(format!("http://{}/peers", relay.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(peers.as_array().unwrap().len(), 1);
    assert_eq!(peers[0]["deviceId"], "dev-a");
}
