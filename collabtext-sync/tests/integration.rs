//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start real servers and connect raw WebSocket clients,
//! verifying the full pipeline from edit intent to every replica.

use collabtext_core::{Char, Message};
use collabtext_sync::{
    AllowAll, Broker, LocalBroker, MemoryStore, ServerConfig, StaticTokens, SyncServer,
    TokenAuthority, UpstreamBroker,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Start a server on a free port, return the port and a handle to it.
async fn start_test_server(
    peer_id: &str,
    broker: Arc<dyn Broker>,
    auth: Arc<dyn TokenAuthority>,
) -> (u16, SyncServer) {
    let mut config = ServerConfig::for_testing();
    config.coordinator.peer_id = peer_id.to_string();
    let server = SyncServer::new(config, Arc::new(MemoryStore::new()), broker, auth).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (port, server)
}

async fn start_open_server() -> (u16, SyncServer) {
    start_test_server("server", Arc::new(LocalBroker::default()), Arc::new(AllowAll)).await
}

async fn connect(port: u16, path: &str) -> Client {
    let url = format!("ws://127.0.0.1:{port}{path}");
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws
}

/// Connect and consume the initial `load` frame.
async fn join(port: u16, path: &str) -> (Client, Vec<Char>) {
    let mut ws = connect(port, path).await;
    match next_message(&mut ws).await {
        Message::Load { doc } => (ws, doc),
        other => panic!("Expected load, got {other:?}"),
    }
}

/// Next JSON frame, skipping control frames.
async fn next_message(ws: &mut Client) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return Message::decode(text.as_str()).unwrap();
        }
    }
}

/// Skip frames until a `crdt_insert` carrying `value` arrives.
async fn next_insert_of(ws: &mut Client, value: &str) -> Message {
    loop {
        let msg = next_message(ws).await;
        if let Message::CrdtInsert(frame) = &msg {
            if frame.ch.value == value {
                return msg;
            }
        }
    }
}

/// Skip frames until a `presence_update` arrives.
async fn next_presence(ws: &mut Client) -> std::collections::BTreeMap<String, String> {
    loop {
        if let Message::PresenceUpdate { users } = next_message(ws).await {
            return users;
        }
    }
}

async fn send(ws: &mut Client, frame: &str) {
    ws.send(WsMessage::text(frame.to_string())).await.unwrap();
}

fn raw_insert(index: i64, value: &str, client: &str) -> String {
    json!({
        "action": "raw_insert",
        "index": index,
        "char": { "value": value },
        "clientID": client,
    })
    .to_string()
}

fn text_of(doc: &[Char]) -> String {
    doc.iter().map(|c| c.value.as_str()).collect()
}

// ─── Single server ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_load_on_connect() {
    let (port, _server) = start_open_server().await;
    let (_ws, doc) = join(port, "/ws/fresh").await;

    assert_eq!(doc.len(), 2);
    assert!(doc[0].is_sentinel() && doc[1].is_sentinel());
}

#[tokio::test]
async fn test_raw_insert_broadcast_to_all_clients() {
    let (port, _server) = start_open_server().await;
    let (mut alice, _) = join(port, "/ws/shared").await;
    let (mut bob, _) = join(port, "/ws/shared").await;

    send(&mut alice, &raw_insert(0, "H", "alice")).await;

    for ws in [&mut alice, &mut bob] {
        match next_message(ws).await {
            Message::CrdtInsert(frame) => {
                assert_eq!(frame.ch.value, "H");
                assert_eq!(frame.client_id, "alice");
                assert_eq!(frame.ch.id.peer_id, "server");
                assert_eq!(frame.ch.id.clock, 1);
            }
            other => panic!("Expected crdt_insert, got {other:?}"),
        }
    }

    let (_late, doc) = join(port, "/ws/shared").await;
    assert_eq!(text_of(&doc), "H");
}

#[tokio::test]
async fn test_bare_path_uses_default_document() {
    let (port, _server) = start_open_server().await;
    let (mut a, _) = join(port, "/ws").await;
    send(&mut a, &raw_insert(0, "d", "a")).await;
    next_insert_of(&mut a, "d").await;

    let (_b, doc) = join(port, "/ws/default_doc").await;
    assert_eq!(text_of(&doc), "d");
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let (port, _server) = start_open_server().await;
    let (mut a, _) = join(port, "/ws/one").await;
    let (mut b, _) = join(port, "/ws/two").await;

    send(&mut a, &raw_insert(0, "1", "a")).await;
    next_insert_of(&mut a, "1").await;
    assert!(timeout(Duration::from_millis(100), b.next()).await.is_err());
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (port, server) = start_open_server().await;
    let (mut ws, _) = join(port, "/ws/doc").await;

    send(&mut ws, "not json at all").await;
    send(&mut ws, r#"{"action":"teleport"}"#).await;
    send(&mut ws, &raw_insert(0, "k", "c")).await;

    next_insert_of(&mut ws, "k").await;
    assert_eq!(server.stats().malformed_frames, 2);
}

#[tokio::test]
async fn test_out_of_range_delete_ignored() {
    let (port, _server) = start_open_server().await;
    let (mut ws, _) = join(port, "/ws/doc").await;

    send(&mut ws, r#"{"action":"raw_delete","index":5}"#).await;
    send(&mut ws, r#"{"action":"raw_delete","index":-1}"#).await;
    send(&mut ws, &raw_insert(0, "a", "c")).await;

    // The insert is the first thing echoed back.
    match next_message(&mut ws).await {
        Message::CrdtInsert(frame) => assert_eq!(frame.ch.value, "a"),
        other => panic!("Expected crdt_insert, got {other:?}"),
    }
}

#[tokio::test]
async fn test_raw_delete_removes_character() {
    let (port, _server) = start_open_server().await;
    let (mut ws, _) = join(port, "/ws/doc").await;

    send(&mut ws, &raw_insert(0, "a", "c")).await;
    send(&mut ws, &raw_insert(1, "b", "c")).await;
    next_insert_of(&mut ws, "b").await;

    send(&mut ws, r#"{"action":"raw_delete","index":0}"#).await;
    match next_message(&mut ws).await {
        Message::CrdtDelete(frame) => assert_eq!(frame.ch.value, "a"),
        other => panic!("Expected crdt_delete, got {other:?}"),
    }

    let (_b, doc) = join(port, "/ws/doc").await;
    assert_eq!(text_of(&doc), "b");
}

#[tokio::test]
async fn test_duplicate_crdt_insert_not_rebroadcast() {
    let (port, _server) = start_open_server().await;
    let (mut a, _) = join(port, "/ws/doc").await;
    let (mut b, _) = join(port, "/ws/doc").await;

    let frame = json!({
        "action": "crdt_insert",
        "char": { "id": { "clock": 7, "peerID": "remote" }, "value": "z", "position": [42] },
        "clientID": "r",
    })
    .to_string();
    send(&mut a, &frame).await;
    next_insert_of(&mut b, "z").await;

    send(&mut a, &frame).await;
    assert!(timeout(Duration::from_millis(150), b.next()).await.is_err());
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let (port, _server) = start_open_server().await;
    let (mut ws, _) = join(port, "/ws/doc").await;

    ws.send(WsMessage::Ping(b"hi".to_vec().into())).await.unwrap();
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        if let WsMessage::Pong(data) = frame {
            assert_eq!(&data[..], b"hi");
            break;
        }
    }
}

#[tokio::test]
async fn test_presence_shared_and_cleared_on_disconnect() {
    let (port, _server) = start_open_server().await;
    let (mut alice, _) = join(port, "/ws/doc").await;
    let (mut bob, _) = join(port, "/ws/doc").await;

    send(&mut alice, r#"{"action":"presence","clientID":"a1","username":"alice"}"#).await;
    let seen = next_presence(&mut bob).await;
    assert_eq!(seen.get("a1").map(String::as_str), Some("alice"));

    alice.close(None).await.unwrap();
    let after = next_presence(&mut bob).await;
    assert!(after.is_empty());
}

#[tokio::test]
async fn test_document_evicted_and_persisted_after_last_disconnect() {
    let (port, server) = start_open_server().await;
    let (mut ws, _) = join(port, "/ws/notes").await;
    send(&mut ws, &raw_insert(0, "p", "c")).await;
    next_insert_of(&mut ws, "p").await;
    ws.close(None).await.unwrap();

    let doc_id = collabtext_sync::DocumentId::parse("notes").unwrap();
    let mut evicted = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !server.registry().contains(&doc_id).await {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "document should be evicted after the hold period");

    let (_ws, doc) = join(port, "/ws/notes").await;
    assert_eq!(text_of(&doc), "p");
}

// ─── Auth ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_auth_refusals() {
    let auth = Arc::new(StaticTokens::new().with_token("good", "ada"));
    let (port, server) = start_test_server("server", Arc::new(LocalBroker::default()), auth).await;

    for (path, status) in [("/ws/d?token=bad", 403), ("/ws/d", 403), ("/elsewhere?token=good", 404)] {
        let url = format!("ws://127.0.0.1:{port}{path}");
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), status, "{path}"),
            other => panic!("Expected HTTP refusal for {path}, got {:?}", other.map(|_| ())),
        }
    }
    assert_eq!(server.stats().refused_connections, 3);
    assert_eq!(server.registry().room_count().await, 0);

    let (_ws, doc) = join(port, "/ws/d?token=good").await;
    assert_eq!(doc.len(), 2);
}

// ─── Multiple processes ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_servers_converge_over_shared_broker() {
    let broker = Arc::new(LocalBroker::default());
    let (port_a, _a) = start_test_server("server-a", broker.clone(), Arc::new(AllowAll)).await;
    let (port_b, _b) = start_test_server("server-b", broker.clone(), Arc::new(AllowAll)).await;

    let (mut alice, _) = join(port_a, "/ws/doc").await;
    let (mut bob, _) = join(port_b, "/ws/doc").await;

    send(&mut alice, &raw_insert(0, "x", "alice")).await;
    next_insert_of(&mut bob, "x").await;

    send(&mut bob, &raw_insert(1, "y", "bob")).await;
    match next_insert_of(&mut alice, "y").await {
        Message::CrdtInsert(frame) => assert_eq!(frame.ch.id.peer_id, "server-b"),
        other => panic!("Expected crdt_insert, got {other:?}"),
    }

    let (_c, on_a) = join(port_a, "/ws/doc").await;
    let (_d, on_b) = join(port_b, "/ws/doc").await;
    assert_eq!(text_of(&on_a), "xy");
    assert_eq!(on_a, on_b);
}

#[tokio::test]
async fn test_agent_links_upstream_to_central_server() {
    let central_auth = Arc::new(StaticTokens::new().with_token("agent-token", "agent"));
    let (central_port, _central) =
        start_test_server("central", Arc::new(LocalBroker::default()), central_auth).await;

    let upstream = UpstreamBroker::new(
        format!("ws://127.0.0.1:{central_port}/ws"),
        Some("agent-token".to_string()),
    );
    let (agent_port, _agent) =
        start_test_server("agent", Arc::new(upstream), Arc::new(AllowAll)).await;

    let (mut local_editor, _) = join(agent_port, "/ws/shared").await;
    let (mut remote_editor, _) = join(central_port, "/ws/shared?token=agent-token").await;

    send(&mut local_editor, &raw_insert(0, "a", "local")).await;
    match next_insert_of(&mut remote_editor, "a").await {
        Message::CrdtInsert(frame) => assert_eq!(frame.ch.id.peer_id, "agent"),
        other => panic!("Expected crdt_insert, got {other:?}"),
    }

    send(&mut remote_editor, &raw_insert(1, "b", "remote")).await;
    next_insert_of(&mut local_editor, "b").await;

    let (_check, doc) = join(agent_port, "/ws/shared").await;
    assert_eq!(text_of(&doc), "ab");
}
