//! Integration tests for cursor presence over real connections.

use std::sync::Arc;

use tandem_collab::client::{ClientConfig, SyncClient, SyncEvent};
use tandem_collab::presence::{color_seed, PresenceEntry};
use tandem_collab::protocol::DocumentKey;
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::session::SessionState;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

async fn start_test_server() -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (url, server)
}

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

async fn next_presence(events: &mut mpsc::Receiver<SyncEvent>) -> PresenceEntry {
    wait_for(events, |e| match e {
        SyncEvent::PresenceUpdated(entry) => Some(entry),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn test_cursor_position_sync() {
    let (url, _server) = start_test_server().await;
    let key = DocumentKey::new("notes", "cursors");

    let (alice, _alice_events) = connect_client(&url, &key).await;
    let (bob, mut bob_events) = connect_client(&url, &key).await;
    let alice_id = alice.connection_id().await.unwrap();

    alice.edit("some text").await.unwrap();
    alice.set_cursor(2, 2).await.unwrap();

    let entry = next_presence(&mut bob_events).await;
    assert_eq!(entry.connection_id, alice_id);
    assert_eq!((entry.cursor_start, entry.cursor_end), (2, 2));
    assert!(entry.is_caret());
    assert_eq!(entry.color_seed, color_seed(&alice_id));
    assert_eq!(bob.remote_cursors().await, vec![entry]);
}

#[tokio::test]
async fn test_selection_is_normalised() {
    let (url, _server) = start_test_server().await;
    let key = DocumentKey::new("notes", "selection");

    let (alice, _alice_events) = connect_client(&url, &key).await;
    let (_bob, mut bob_events) = connect_client(&url, &key).await;

    alice.edit("select me please").await.unwrap();
    alice.set_cursor(9, 3).await.unwrap();

    let entry = next_presence(&mut bob_events).await;
    assert_eq!((entry.cursor_start, entry.cursor_end), (3, 9));
    assert!(!entry.is_caret());
}

#[tokio::test]
async fn test_own_cursor_is_not_echoed() {
    let (url, _server) = start_test_server().await;
    let key = DocumentKey::new("notes", "self");

    let (alice, mut alice_events) = connect_client(&url, &key).await;
    alice.edit("abc").await.unwrap();
    alice.set_cursor(1, 1).await.unwrap();
    alice.send_ping().await.unwrap();

    sleep(Duration::from_millis(100)).await;
    while let Ok(event) = alice_events.try_recv() {
        assert!(
            !matches!(event, SyncEvent::PresenceUpdated(_)),
            "own cursor echoed: {event:?}"
        );
    }
    assert!(alice.remote_cursors().await.is_empty());
}

#[tokio::test]
async fn test_remote_cursor_follows_edits() {
    let (url, _server) = start_test_server().await;
    let key = DocumentKey::new("notes", "shift");

    let (alice, _alice_events) = connect_client(&url, &key).await;
    let (bob, mut bob_events) = connect_client(&url, &key).await;

    alice.edit("hello").await.unwrap();
    wait_for(&mut bob_events, |e| match e {
        SyncEvent::RemoteEdit { content, .. } => (content == "hello").then_some(()),
        _ => None,
    })
    .await;
    alice.set_cursor(3, 5).await.unwrap();
    next_presence(&mut bob_events).await;

    // Bob types in front of Alice's selection.
    bob.edit(">>hello").await.unwrap();
    let entry = bob.remote_cursors().await.pop().unwrap();
    assert_eq!((entry.cursor_start, entry.cursor_end), (5, 7));

    // A late joiner sees the shifted selection in its snapshot.
    timeout(WAIT, async {
        while bob.session_state().await != SessionState::Synced {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let (carol, _carol_events) = connect_client(&url, &key).await;
    let cursors = carol.remote_cursors().await;
    assert_eq!(cursors.len(), 1);
    assert_eq!((cursors[0].cursor_start, cursors[0].cursor_end), (5, 7));
}

#[tokio::test]
async fn test_presence_removed_on_disconnect() {
    let (url, server) = start_test_server().await;
    let key = DocumentKey::new("notes", "goodbye");

    let (alice, _alice_events) = connect_client(&url, &key).await;
    let (bob, mut bob_events) = connect_client(&url, &key).await;
    let alice_id = alice.connection_id().await.unwrap();

    alice.set_cursor(0, 0).await.unwrap();
    next_presence(&mut bob_events).await;

    alice.disconnect().await;
    let gone = wait_for(&mut bob_events, |e| match e {
        SyncEvent::PresenceRemoved(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(gone, alice_id);
    assert!(bob.remote_cursors().await.is_empty());

    let room = server.rooms().get_or_spawn(&key).await.unwrap();
    let snapshot = room.inspect().await.unwrap();
    assert_eq!(snapshot.members, 1);
    assert_eq!(snapshot.presence, 0);
}

#[tokio::test]
async fn test_leave_keeps_subscription() {
    let (url, _server) = start_test_server().await;
    let key = DocumentKey::new("notes", "leave");

    let (alice, _alice_events) = connect_client(&url, &key).await;
    let (bob, mut bob_events) = connect_client(&url, &key).await;

    alice.set_cursor(0, 0).await.unwrap();
    next_presence(&mut bob_events).await;
    alice.leave().await.unwrap();
    wait_for(&mut bob_events, |e| {
        matches!(e, SyncEvent::PresenceRemoved(_)).then_some(())
    })
    .await;

    // Still receiving edits.
    bob.edit("after leave").await.unwrap();
    timeout(WAIT, async {
        while alice.content().await != "after leave" {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edit never arrived");
}
