//! Integration tests for end-to-end room collaboration.
//!
//! These tests start a real server on an ephemeral port and connect real
//! WebSocket clients, verifying the full relay pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use pairpad_collab::protocol::{Envelope, OutputStatus, RoomId};
use pairpad_collab::server::CollabServer;
use pairpad_collab::storage::{MemoryRoomStore, Room, RoomStore, DEFAULT_CODE};
use pairpad_collab::ServerConfig;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    server: Arc<CollabServer>,
    store: Arc<MemoryRoomStore>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{path}", self.port)
    }

    async fn connect(&self, room_id: &RoomId) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(self.url(&format!("/ws/{room_id}")))
            .await
            .expect("connect");
        ws
    }

    /// Wait until the registry reports `expected` members for the room.
    async fn wait_for_count(&self, room_id: &RoomId, expected: usize) {
        let registry = self.server.registry().clone();
        let result = timeout(Duration::from_secs(2), async {
            while registry.count(room_id).await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "room {room_id} never reached {expected} members");
    }
}

/// Start a server on a free port.
async fn start_test_server(config: ServerConfig) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store = Arc::new(MemoryRoomStore::new());
    let server = Arc::new(CollabServer::new(
        ServerConfig {
            bind_addr: format!("127.0.0.1:{port}"),
            ..config
        },
        store.clone(),
    ));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    TestServer {
        port,
        server,
        store,
    }
}

async fn recv(ws: &mut Client) -> Envelope {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        if let Message::Text(text) = msg {
            return Envelope::decode(text.as_str()).expect("valid envelope");
        }
    }
}

async fn send(ws: &mut Client, envelope: &Envelope) {
    let text = envelope.encode().unwrap().to_string();
    ws.send(Message::text(text)).await.unwrap();
}

/// Assert that no text frame arrives within a short window.
async fn assert_silent(ws: &mut Client) {
    let result = timeout(Duration::from_millis(150), ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("unexpected frame: {}", text.as_str());
    }
}

/// Connect and consume the join handshake (init + user_count).
async fn join(test: &TestServer, room_id: &RoomId, expected_count: usize) -> Client {
    let mut ws = test.connect(room_id).await;
    match recv(&mut ws).await {
        Envelope::Init { room_id: id, .. } => assert_eq!(&id, room_id),
        other => panic!("expected init, got {other:?}"),
    }
    assert_eq!(recv(&mut ws).await, Envelope::user_count(expected_count));
    ws
}

#[tokio::test]
async fn test_join_receives_init_then_count() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut ws = test.connect(&room.room_id).await;
    assert_eq!(
        recv(&mut ws).await,
        Envelope::init(room.room_id.clone(), DEFAULT_CODE, "python")
    );
    assert_eq!(recv(&mut ws).await, Envelope::user_count(1));
    assert_eq!(test.server.registry().count(&room.room_id).await, 1);
}

#[tokio::test]
async fn test_init_carries_stored_buffer() {
    let test = start_test_server(ServerConfig::default()).await;
    let room_id = RoomId::from("abc12345");
    test.store.insert(Room {
        code: "x=1\n".into(),
        ..Room::new(room_id.clone(), "python")
    });

    let mut ws = test.connect(&room_id).await;
    assert_eq!(
        recv(&mut ws).await,
        Envelope::init(room_id.clone(), "x=1\n", "python")
    );
    assert_eq!(recv(&mut ws).await, Envelope::user_count(1));
    assert_silent(&mut ws).await;
}

#[tokio::test]
async fn test_second_member_updates_count_for_everyone() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    let _bob = join(&test, &room.room_id, 2).await;

    assert_eq!(recv(&mut alice).await, Envelope::user_count(2));
}

#[tokio::test]
async fn test_code_update_relayed_to_others_and_persisted() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    let mut bob = join(&test, &room.room_id, 2).await;
    assert_eq!(recv(&mut alice).await, Envelope::user_count(2));

    let update = Envelope::code_update("print(1)\n", 9);
    send(&mut alice, &update).await;

    assert_eq!(recv(&mut bob).await, update);
    assert_silent(&mut alice).await;
    assert_eq!(
        test.store.get(&room.room_id).unwrap().unwrap().code,
        "print(1)\n"
    );

    // A late joiner sees the latest buffer in its snapshot.
    let mut carol = test.connect(&room.room_id).await;
    assert_eq!(
        recv(&mut carol).await,
        Envelope::init(room.room_id.clone(), "print(1)\n", "python")
    );
}

#[tokio::test]
async fn test_cursor_move_not_echoed() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    let mut bob = join(&test, &room.room_id, 2).await;
    assert_eq!(recv(&mut alice).await, Envelope::user_count(2));

    send(&mut bob, &Envelope::cursor_move(42)).await;
    assert_eq!(recv(&mut alice).await, Envelope::cursor_move(42));
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_code_output_reaches_sender_too() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    let mut bob = join(&test, &room.room_id, 2).await;
    assert_eq!(recv(&mut alice).await, Envelope::user_count(2));

    let running = Envelope::code_output(OutputStatus::Running, None, None);
    let done = Envelope::code_output(OutputStatus::Completed, Some("1\n".into()), None);
    send(&mut alice, &running).await;
    send(&mut alice, &done).await;

    assert_eq!(recv(&mut alice).await, running);
    assert_eq!(recv(&mut alice).await, done);
    assert_eq!(recv(&mut bob).await, running);
    assert_eq!(recv(&mut bob).await, done);
}

#[tokio::test]
async fn test_disconnect_announces_new_count() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    // Bob's own join already yielded user_count 2.
    let mut bob = join(&test, &room.room_id, 2).await;

    alice.close(None).await.unwrap();
    assert_eq!(recv(&mut bob).await, Envelope::user_count(1));
    test.wait_for_count(&room.room_id, 1).await;
}

#[tokio::test]
async fn test_last_member_leaving_prunes_room() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    alice.close(None).await.unwrap();

    test.wait_for_count(&room.room_id, 0).await;
    assert!(!test.server.registry().contains_room(&room.room_id).await);
    // The stored room outlives its connections.
    assert!(test.store.get(&room.room_id).unwrap().is_some());
}

#[tokio::test]
async fn test_missing_room_closes_with_4004() {
    let test = start_test_server(ServerConfig::default()).await;
    let mut ws = test.connect(&RoomId::from("nope1234")).await;

    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("read error");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::from(4004));
            assert_eq!(frame.reason.as_str(), "room not found");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_eq!(test.server.registry().room_count().await, 0);
    assert_eq!(test.server.stats().rejected_joins, 1);
}

#[tokio::test]
async fn test_unknown_path_rejected_at_handshake() {
    let test = start_test_server(ServerConfig::default()).await;
    let result = tokio_tungstenite::connect_async(test.url("/rooms/abc")).await;
    assert!(result.is_err(), "non-/ws/ paths must not upgrade");
}

#[tokio::test]
async fn test_invalid_frames_ignored_connection_survives() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    let mut bob = join(&test, &room.room_id, 2).await;
    assert_eq!(recv(&mut alice).await, Envelope::user_count(2));

    for junk in [
        "not json",
        r#"{"code":"x"}"#,
        r#"{"type":"explode"}"#,
        r#"{"type":"user_count","count":99}"#,
        r#"{"type":"init","code":"","language":"python","roomId":"x"}"#,
    ] {
        bob.send(Message::text(junk)).await.unwrap();
    }
    send(&mut bob, &Envelope::cursor_move(3)).await;

    // Only the valid frame reaches the peer, and bob is still a member.
    assert_eq!(recv(&mut alice).await, Envelope::cursor_move(3));
    assert_eq!(test.server.registry().count(&room.room_id).await, 2);
    assert!(test.server.stats().inbound_messages >= 6);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let test = start_test_server(ServerConfig::default()).await;
    let red = test.store.create("python").unwrap();
    let blue = test.store.create("javascript").unwrap();

    let mut a = join(&test, &red.room_id, 1).await;
    let mut b = join(&test, &blue.room_id, 1).await;

    send(&mut a, &Envelope::code_output(OutputStatus::Completed, Some("red".into()), None)).await;
    assert!(matches!(recv(&mut a).await, Envelope::CodeOutput { .. }));
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_idle_connection_closed() {
    let config = ServerConfig {
        idle_timeout: Some(Duration::from_millis(200)),
        ..ServerConfig::default()
    };
    let test = start_test_server(config).await;
    let room = test.store.create("python").unwrap();

    let mut ws = join(&test, &room.room_id, 1).await;
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "idle connection should be closed");
    test.wait_for_count(&room.room_id, 0).await;
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let test = start_test_server(ServerConfig::default()).await;
    let room = test.store.create("python").unwrap();

    let mut alice = join(&test, &room.room_id, 1).await;
    let stats = test.server.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);

    alice.close(None).await.unwrap();
    test.wait_for_count(&room.room_id, 0).await;
    let result = timeout(Duration::from_secs(2), async {
        while test.server.stats().active_connections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok());
}
