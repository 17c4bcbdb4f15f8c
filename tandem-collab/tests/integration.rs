//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tandem_collab::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use tandem_collab::protocol::{
    ClientMessage, ConnectionId, DocumentKey, RejectReason, ServerMessage,
};
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::session::SessionState;
use tandem_core::Operation;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

/// Start a server on a free port, return its URL and handle.
async fn start_test_server(config: ServerConfig) -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (url, server)
}

async fn start_default_server() -> (String, Arc<SyncServer>) {
    start_test_server(ServerConfig::default()).await
}

/// Connect a client and wait for its first snapshot.
async fn connect_client(url: &str, key: &DocumentKey) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(ClientConfig::new(url, key.clone()));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Resynced { .. }).then_some(())).await;
    (client, events)
}

async fn wait_for<T>(
    events: &mut mpsc::Receiver<SyncEvent>,
    mut pick: impl FnMut(SyncEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let Some(found) = pick(event) {
                return found;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until the client has caught up to `version` with nothing pending.
async fn settle(client: &SyncClient, version: u64) {
    timeout(WAIT, async {
        loop {
            if client.version().await == version
                && client.session_state().await == SessionState::Synced
            {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client never settled at version {version}"));
}

/// A bare protocol peer, for driving the server directly.
struct RawPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawPeer {
    async fn connect(url: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let bytes = msg.encode().unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .unwrap();
            if let Message::Binary(data) = frame {
                return ServerMessage::decode(&data).unwrap();
            }
        }
    }

    /// Subscribe and return (connection id, version, content).
    async fn subscribe(&mut self, key: &DocumentKey) -> (ConnectionId, u64, String) {
        self.send(ClientMessage::Subscribe { key: key.clone() }).await;
        match self.recv().await {
            ServerMessage::Snapshot {
                connection_id,
                version,
                content,
                ..
            } => (connection_id, version, content),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, server) = start_default_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");

    timeout(WAIT, async {
        while server.stats().await.total_connections == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_client_connects_and_receives_snapshot() {
    let (url, _server) = start_default_server().await;
    let key = DocumentKey::new("notes", "fresh");

    let mut client = SyncClient::new(ClientConfig::new(&url, key));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(WAIT, events.recv()).await.unwrap() {
        Some(SyncEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    let (version, content) = wait_for(&mut events, |e| match e {
        SyncEvent::Resynced {
            version, content, ..
        } => Some((version, content)),
        _ => None,
    })
    .await;

    assert_eq!(version, 0);
    assert_eq!(content, "");
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.session_state().await, SessionState::Synced);
    assert!(client.connection_id().await.is_some());
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (url, server) = start_default_server().await;
    let key = DocumentKey::new("notes", "hello");

    let (alice, _alice_events) = connect_client(&url, &key).await;
    alice.edit("hello").await.unwrap();
    settle(&alice, 1).await;

    let (bob, _bob_events) = connect_client(&url, &key).await;
    assert_eq!(bob.content().await, "hello");
    assert_eq!(bob.version().await, 1);

    // Neither edit has seen the other.
    let (a, b) = tokio::join!(alice.edit("hello world"), bob.edit(""));
    a.unwrap();
    b.unwrap();

    settle(&alice, 3).await;
    settle(&bob, 3).await;
    assert_eq!(alice.content().await, " world");
    assert_eq!(bob.content().await, " world");

    let room = server.rooms().get_or_spawn(&key).await.unwrap();
    let snapshot = room.inspect().await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.content, " world");
    assert_eq!(snapshot.members, 2);
}

#[tokio::test]
async fn test_same_offset_inserts_order_by_connection_id() {
    let (url, server) = start_default_server().await;
    let key = DocumentKey::new("notes", "tie");

    let mut first = RawPeer::connect(&url).await;
    let mut second = RawPeer::connect(&url).await;
    let (first_id, _, _) = first.subscribe(&key).await;
    let (second_id, _, _) = second.subscribe(&key).await;

    first
        .send(ClientMessage::Submit {
            base_version: 0,
            op: Operation::insert(0, "1"),
        })
        .await;
    second
        .send(ClientMessage::Submit {
            base_version: 0,
            op: Operation::insert(0, "2"),
        })
        .await;

    // Each peer sees its own ack and the other's op, in some order.
    for peer in [&mut first, &mut second] {
        for _ in 0..2 {
            match peer.recv().await {
                ServerMessage::Ack { .. } | ServerMessage::Op { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    let expected = if first_id < second_id { "12" } else { "21" };
    let room = server.rooms().get_or_spawn(&key).await.unwrap();
    let snapshot = room.inspect().await.unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.content, expected);
}

#[tokio::test]
async fn test_versions_are_assigned_in_order() {
    let (url, _server) = start_default_server().await;
    let key = DocumentKey::new("notes", "counter");

    let mut writer = RawPeer::connect(&url).await;
    let mut reader = RawPeer::connect(&url).await;
    writer.subscribe(&key).await;
    reader.subscribe(&key).await;

    for (base_version, c) in (0..5u64).zip('a'..) {
        writer
            .send(ClientMessage::Submit {
                base_version,
                op: Operation::insert(base_version as usize, c.to_string()),
            })
            .await;
        match writer.recv().await {
            ServerMessage::Ack { version, .. } => assert_eq!(version, base_version + 1),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        if let ServerMessage::Op { version, .. } = reader.recv().await {
            seen.push(version);
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    let mut late = RawPeer::connect(&url).await;
    let (_, version, content) = late.subscribe(&key).await;
    assert_eq!(version, 5);
    assert_eq!(content, "abcde");
}

#[tokio::test]
async fn test_rejections() {
    let config = ServerConfig {
        log_window: 2,
        ..ServerConfig::default()
    };
    let (url, server) = start_test_server(config).await;
    let key = DocumentKey::new("notes", "strict");

    let mut peer = RawPeer::connect(&url).await;
    peer.subscribe(&key).await;

    // Out of range for an empty document.
    peer.send(ClientMessage::Submit {
        base_version: 0,
        op: Operation::delete(0, 3),
    })
    .await;
    match peer.recv().await {
        ServerMessage::Rejected {
            base_version: 0,
            reason: RejectReason::Malformed(_),
        } => {}
        other => panic!("expected malformed rejection, got {other:?}"),
    }

    // A version the server has not reached.
    peer.send(ClientMessage::Submit {
        base_version: 9,
        op: Operation::insert(0, "x"),
    })
    .await;
    assert_eq!(
        peer.recv().await,
        ServerMessage::Rejected {
            base_version: 9,
            reason: RejectReason::Conflict
        }
    );

    for base_version in 0..3u64 {
        peer.send(ClientMessage::Submit {
            base_version,
            op: Operation::insert(0, "x"),
        })
        .await;
        assert!(matches!(peer.recv().await, ServerMessage::Ack { .. }));
    }

    // Version 0 fell out of the two-op window.
    peer.send(ClientMessage::Submit {
        base_version: 0,
        op: Operation::insert(0, "late"),
    })
    .await;
    assert_eq!(
        peer.recv().await,
        ServerMessage::Rejected {
            base_version: 0,
            reason: RejectReason::Conflict
        }
    );

    // Rejections change nothing.
    let room = server.rooms().get_or_spawn(&key).await.unwrap();
    let snapshot = room.inspect().await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.content, "xxx");
    assert_eq!(server.stats().await.rejected_ops, 3);
}

#[tokio::test]
async fn test_reconnect_replaces_replica_with_server_state() {
    let (url, server) = start_default_server().await;
    let key = DocumentKey::new("notes", "reconnect");

    let (alice, mut alice_events) = connect_client(&url, &key).await;
    let (bob, _bob_events) = connect_client(&url, &key).await;

    alice.edit("abc").await.unwrap();
    settle(&alice, 1).await;
    settle(&bob, 1).await;

    alice.disconnect().await;
    wait_for(&mut alice_events, |e| (e == SyncEvent::Disconnected).then_some(())).await;
    assert_eq!(alice.session_state().await, SessionState::Stale);

    // Kept locally, never sent.
    alice.edit("abc!").await.unwrap();
    assert_eq!(alice.content().await, "abc!");

    for (i, text) in ["ab", "a", "", "X", "XY", "XYZ"].into_iter().enumerate() {
        bob.edit(text).await.unwrap();
        settle(&bob, i as u64 + 2).await;
    }

    alice.connect().await.unwrap();
    let (version, content, discarded) = wait_for(&mut alice_events, |e| match e {
        SyncEvent::Resynced {
            version,
            content,
            discarded,
        } => Some((version, content, discarded)),
        _ => None,
    })
    .await;
    assert_eq!(version, 7);
    assert_eq!(content, "XYZ");
    assert_eq!(discarded.as_deref(), Some("abc!"));
    assert_eq!(alice.content().await, "XYZ");
    assert_eq!(alice.session_state().await, SessionState::Synced);

    // The discarded edit never reached the server.
    let room = server.rooms().get_or_spawn(&key).await.unwrap();
    let snapshot = room.inspect().await.unwrap();
    assert_eq!(snapshot.version, 7);
    assert_eq!(snapshot.content, "XYZ");
}

#[tokio::test]
async fn test_buffered_edits_flush_after_ack() {
    let (url, _server) = start_default_server().await;
    let key = DocumentKey::new("notes", "typing");

    let (alice, _alice_events) = connect_client(&url, &key).await;
    let (bob, _bob_events) = connect_client(&url, &key).await;

    // Typed faster than the round trip: the tail is buffered and composed.
    let mut text = String::new();
    for c in "typing".chars() {
        text.push(c);
        alice.edit(&text).await.unwrap();
    }

    timeout(WAIT, async {
        loop {
            if alice.session_state().await == SessionState::Synced
                && bob.content().await == "typing"
                && bob.version().await == alice.version().await
            {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edits never converged");
    assert_eq!(alice.content().await, "typing");
    assert!(alice.version().await <= 6);
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let (url, server) = start_default_server().await;
    let notes = DocumentKey::new("notes", "shared");
    let drafts = DocumentKey::new("drafts", "shared");

    let (a, _a_events) = connect_client(&url, &notes).await;
    let (b, _b_events) = connect_client(&url, &drafts).await;

    a.edit("in notes").await.unwrap();
    settle(&a, 1).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(b.version().await, 0);
    assert_eq!(b.content().await, "");
    assert_eq!(
        server.rooms().active_documents().await,
        vec![drafts.clone(), notes.clone()]
    );
}

#[tokio::test]
async fn test_ping_pong_and_bad_frames() {
    let (url, _server) = start_default_server().await;
    let mut peer = RawPeer::connect(&url).await;

    peer.ws
        .send(Message::Binary(vec![0xff, 0x00, 0x13].into()))
        .await
        .unwrap();
    peer.send(ClientMessage::Ping).await;
    assert_eq!(peer.recv().await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_stats_track_connections() {
    let (url, server) = start_default_server().await;
    let key = DocumentKey::new("notes", "stats");

    let (client, mut events) = connect_client(&url, &key).await;
    client.edit("x").await.unwrap();
    settle(&client, 1).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.applied_ops, 1);
    assert!(stats.total_messages >= 2);

    client.disconnect().await;
    wait_for(&mut events, |e| (e == SyncEvent::Disconnected).then_some(())).await;
    timeout(WAIT, async {
        while server.stats().await.active_connections != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never released");
}

#[tokio::test]
async fn test_lagging_connection_is_told_to_resync() {
    let config = ServerConfig {
        broadcast_capacity: 1,
        ..ServerConfig::default()
    };
    let (url, server) = start_test_server(config).await;
    let key = DocumentKey::new("notes", "lag");

    // Subscribes, then stops reading until the socket backs up.
    let mut victim = RawPeer::connect(&url).await;
    victim.subscribe(&key).await;

    let mut writer = RawPeer::connect(&url).await;
    writer.subscribe(&key).await;
    let chunk = "x".repeat(1 << 20);
    let mut version = 0;
    for _ in 0..32 {
        for op in [Operation::insert(0, chunk.as_str()), Operation::delete(0, 1 << 20)] {
            writer
                .send(ClientMessage::Submit {
                    base_version: version,
                    op,
                })
                .await;
            match writer.recv().await {
                ServerMessage::Ack { version: acked, .. } => version = acked,
                other => panic!("expected ack, got {other:?}"),
            }
        }
    }
    assert_eq!(version, 64);

    let mut ops_before_resync = 0;
    loop {
        match victim.recv().await {
            ServerMessage::Op { .. } => ops_before_resync += 1,
            ServerMessage::ResyncRequired => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(ops_before_resync < 64);
    assert!(server.stats().await.resyncs_forced >= 1);

    // Subscribing again brings the connection to the latest state.
    let (_, resync_version, content) = victim.subscribe(&key).await;
    assert_eq!(resync_version, 64);
    assert_eq!(content, "");

    writer
        .send(ClientMessage::Submit {
            base_version: 64,
            op: Operation::insert(0, "after"),
        })
        .await;
    assert!(matches!(victim.recv().await, ServerMessage::Op { version: 65, .. }));
}

#[tokio::test]
async fn test_conflicting_edit_resyncs_to_server_state() {
    let config = ServerConfig {
        log_window: 0,
        ..ServerConfig::default()
    };
    let (url, server) = start_test_server(config).await;
    let key = DocumentKey::new("notes", "no-history");

    let (alice, mut alice_events) = connect_client(&url, &key).await;
    let (bob, mut bob_events) = connect_client(&url, &key).await;

    // Both based on version 0; with no history the second one cannot be
    // rebased and is rejected.
    let (a, b) = tokio::join!(alice.edit("from alice"), bob.edit("from bob"));
    a.unwrap();
    b.unwrap();

    settle(&alice, 1).await;
    settle(&bob, 1).await;
    let winner = alice.content().await;
    assert_eq!(bob.content().await, winner);
    assert!(winner == "from alice" || winner == "from bob");

    let stats = server.stats().await;
    assert_eq!((stats.applied_ops, stats.rejected_ops), (1, 1));

    let loser_events = if winner == "from alice" {
        &mut bob_events
    } else {
        &mut alice_events
    };
    wait_for(&mut *loser_events, |e| match e {
        SyncEvent::Rejected {
            base_version: 0,
            reason: RejectReason::Conflict,
        } => Some(()),
        _ => None,
    })
    .await;
    let discarded = wait_for(loser_events, |e| match e {
        SyncEvent::Resynced { discarded, .. } => Some(discarded),
        _ => None,
    })
    .await;
    assert!(discarded.is_some());
}
