//! End-to-end dialog flows through the registry.
//!
//! These tests drive the actor system the way the WebSocket layer does:
//! rooms are requested from the registry and events are observed on the
//! per-connection outbound channels.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use common::types::{Pagination, PresenceStatus};
use messenger_gateway::actors::connection::{ConnectionActor, ConnectionHandle};
use messenger_gateway::actors::dialog::DialogRoomHandle;
use messenger_gateway::actors::metrics::ActorMetrics;
use messenger_gateway::actors::registry::{RegistryActor, RegistryHandle};
use messenger_gateway::config::RoomConfig;
use messenger_gateway::connections::ConnectionTable;
use messenger_gateway::store::{InMemoryStore, MessageStore};
use messenger_protocol::dialog::{CreateMessage, DialogServerEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    registry: RegistryHandle,
    store: Arc<InMemoryStore>,
    table: Arc<ConnectionTable>,
    metrics: Arc<ActorMetrics>,
}

fn spawn_harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let table = Arc::new(ConnectionTable::new());
    let metrics = ActorMetrics::new();

    let (registry, _task) = RegistryActor::spawn(
        CancellationToken::new(),
        Arc::clone(&store) as Arc<dyn MessageStore>,
        Arc::clone(&table),
        RoomConfig::default(),
        Arc::clone(&metrics),
    );

    Harness {
        registry,
        store,
        table,
        metrics,
    }
}

fn connect(
    harness: &Harness,
    connection_id: &str,
    user_id: &str,
) -> (ConnectionHandle, mpsc::Receiver<String>) {
    harness.table.register(user_id, connection_id);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (handle, _task) = ConnectionActor::spawn(
        connection_id.to_string(),
        user_id.to_string(),
        outbound_tx,
        CancellationToken::new(),
        Arc::clone(&harness.metrics),
        64,
    );
    (handle, outbound_rx)
}

async fn next_event(rx: &mut mpsc::Receiver<String>) -> DialogServerEvent {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed");
    serde_json::from_str(&frame).expect("frame should decode")
}

async fn join_dialog(
    harness: &Harness,
    dialog_id: &str,
    connection_id: &str,
    user_id: &str,
) -> (DialogRoomHandle, ConnectionHandle, mpsc::Receiver<String>) {
    let room = harness
        .registry
        .dialog_room(dialog_id.to_string())
        .await
        .unwrap();
    let (conn, rx) = connect(harness, connection_id, user_id);
    room.join(
        connection_id.to_string(),
        user_id.to_string(),
        conn.clone(),
        Pagination::default(),
    )
    .await
    .unwrap();
    (room, conn, rx)
}

#[tokio::test]
async fn test_message_fans_out_to_every_member_exactly_once() {
    let harness = spawn_harness();
    harness.store.seed_dialog("d1", "Pair", &["u1", "u2"]);

    let (room, _c1, mut rx1) = join_dialog(&harness, "d1", "c1", "u1").await;
    let (_room2, _c2, mut rx2) = join_dialog(&harness, "d1", "c2", "u2").await;

    // u1 sees u2 come online.
    let event = next_event(&mut rx1).await;
    assert!(matches!(
        event,
        DialogServerEvent::UserStatusChanged {
            status: PresenceStatus::Online,
            ..
        }
    ));

    room.send_message(
        "c1".to_string(),
        CreateMessage {
            text: "hi".to_string(),
            ..CreateMessage::default()
        },
        Vec::new(),
    )
    .await
    .unwrap();

    // Both members, sender included, get the message once.
    for rx in [&mut rx1, &mut rx2] {
        let DialogServerEvent::NewMessage(record) = next_event(rx).await else {
            panic!("expected new_message first");
        };
        assert_eq!(record.text, "hi");
        assert_eq!(record.author_id, "u1");

        // The next frame is the read-model update, not a duplicate.
        assert!(matches!(
            next_event(rx).await,
            DialogServerEvent::DialogShortUpdated(_)
        ));
    }
}

#[tokio::test]
async fn test_receipts_are_monotonic_across_connections() {
    let harness = spawn_harness();
    harness.store.seed_dialog("d1", "Pair", &["u1", "u2"]);

    let (room, _c1, mut rx1) = join_dialog(&harness, "d1", "c1", "u1").await;
    let (_room2, _c2, mut rx2) = join_dialog(&harness, "d1", "c2", "u2").await;
    let _ = next_event(&mut rx1).await; // u2 online

    room.send_message(
        "c1".to_string(),
        CreateMessage {
            text: "ping".to_string(),
            ..CreateMessage::default()
        },
        Vec::new(),
    )
    .await
    .unwrap();

    let DialogServerEvent::NewMessage(record) = next_event(&mut rx2).await else {
        panic!("expected new_message");
    };
    let _ = next_event(&mut rx1).await; // u1's copy
    let _ = next_event(&mut rx1).await; // dialog_short_updated
    let _ = next_event(&mut rx2).await; // dialog_short_updated

    // Read first.
    room.receipt(
        "c2".to_string(),
        messenger_gateway::actors::messages::ReceiptKind::Read,
        vec![record.id.clone()],
    )
    .await
    .unwrap();

    let DialogServerEvent::DialogLastMessageUpdated { last_message, .. } =
        next_event(&mut rx1).await
    else {
        panic!("expected last-message update");
    };
    assert!(last_message.date_read.is_some());
    assert!(
        last_message.date_delivered.is_some(),
        "read implies delivered"
    );

    // A later delivered receipt for the same message is stale and silent.
    room.receipt(
        "c2".to_string(),
        messenger_gateway::actors::messages::ReceiptKind::Delivered,
        vec![record.id.clone()],
    )
    .await
    .unwrap();

    // Prove silence by observing that the next frame is the typing
    // indicator sent afterwards.
    room.set_typing("c2".to_string(), true).await.unwrap();
    assert!(matches!(
        next_event(&mut rx1).await,
        DialogServerEvent::UserTyping {
            is_typing: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_multi_device_presence_collapses_to_one_transition() {
    let harness = spawn_harness();
    harness.store.seed_dialog("d1", "Pair", &["u1", "u2"]);

    let (room, _c1, mut rx1) = join_dialog(&harness, "d1", "c1", "u1").await;

    // u2 joins from two devices; u1 sees exactly one online transition.
    let (_room2, _c2a, _rx2a) = join_dialog(&harness, "d1", "c2a", "u2").await;
    let event = next_event(&mut rx1).await;
    assert!(matches!(
        event,
        DialogServerEvent::UserStatusChanged {
            status: PresenceStatus::Online,
            ..
        }
    ));

    let (_room3, _c2b, _rx2b) = join_dialog(&harness, "d1", "c2b", "u2").await;

    // First device leaves: u2 is still active, no transition yet.
    room.leave("c2a".to_string()).await.unwrap();
    harness.table.unregister("u2", "c2a");

    // Second device leaves: now the offline transition fires.
    harness.table.unregister("u2", "c2b");
    room.leave("c2b".to_string()).await.unwrap();

    let event = next_event(&mut rx1).await;
    let DialogServerEvent::UserStatusChanged {
        user_id, status, ..
    } = event
    else {
        panic!("expected status change");
    };
    assert_eq!(user_id, "u2");
    assert_eq!(status, PresenceStatus::Offline);
}

#[tokio::test]
async fn test_room_is_destroyed_when_all_members_leave() {
    let harness = spawn_harness();
    harness.store.seed_dialog("d1", "Pair", &["u1", "u2"]);

    let (room, _c1, _rx1) = join_dialog(&harness, "d1", "c1", "u1").await;
    let (_room2, _c2, _rx2) = join_dialog(&harness, "d1", "c2", "u2").await;

    let status = harness.registry.status().await.unwrap();
    assert_eq!(status.dialog_rooms, 1);

    room.leave("c1".to_string()).await.unwrap();
    room.leave("c2".to_string()).await.unwrap();

    // Teardown is asynchronous through the registry mailbox.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = harness.registry.status().await.unwrap();
    assert_eq!(status.dialog_rooms, 0);

    // Joining again transparently recreates the room.
    let (_room, _c1, _rx1) = join_dialog(&harness, "d1", "c3", "u1").await;
    let status = harness.registry.status().await.unwrap();
    assert_eq!(status.dialog_rooms, 1);
}

#[tokio::test]
async fn test_disconnect_without_leave_is_swept() {
    let harness = spawn_harness();
    harness.store.seed_dialog("d1", "Pair", &["u1", "u2"]);

    let (_room, _c1, mut rx1) = join_dialog(&harness, "d1", "c1", "u1").await;
    let (_room2, _c2, _rx2) = join_dialog(&harness, "d1", "c2", "u2").await;
    let _ = next_event(&mut rx1).await; // u2 online

    // c2 drops without a leave frame, as the socket teardown path does.
    harness.table.unregister("u2", "c2");
    let released = harness.registry.connection_closed("c2".to_string()).await;
    assert!(released.is_empty(), "dialog sweeps release no media");

    let event = next_event(&mut rx1).await;
    assert!(matches!(
        event,
        DialogServerEvent::UserStatusChanged {
            status: PresenceStatus::Offline,
            ..
        }
    ));
}
