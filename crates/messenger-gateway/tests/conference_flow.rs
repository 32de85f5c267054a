//! End-to-end conference flows: registry, room actors, and the media
//! plane working together.
//!
//! The begin/commit exchanges here mirror the WebSocket dispatch path,
//! with `LoopbackMediaPlane` standing in for the SFU so the tests can
//! assert that no media resource outlives its owner.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use common::types::Pagination;
use messenger_gateway::actors::conference::ConferenceRoomHandle;
use messenger_gateway::actors::connection::{ConnectionActor, ConnectionHandle};
use messenger_gateway::actors::messages::ReleasedMedia;
use messenger_gateway::actors::metrics::ActorMetrics;
use messenger_gateway::actors::registry::{RegistryActor, RegistryHandle};
use messenger_gateway::config::RoomConfig;
use messenger_gateway::connections::ConnectionTable;
use messenger_gateway::media::{LoopbackMediaPlane, MediaPlane};
use messenger_gateway::store::{InMemoryStore, MessageStore};
use messenger_protocol::conference::{ConferenceServerEvent, ProducerKind};
use messenger_protocol::dialog::DialogServerEvent;
use messenger_protocol::signal::{ModeratorActionKind, Signal};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    registry: RegistryHandle,
    store: Arc<InMemoryStore>,
    table: Arc<ConnectionTable>,
    media: Arc<LoopbackMediaPlane>,
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
        media: Arc::new(LoopbackMediaPlane::new()),
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

async fn next_conference_event(rx: &mut mpsc::Receiver<String>) -> ConferenceServerEvent {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed");
    serde_json::from_str(&frame).expect("frame should decode")
}

async fn next_dialog_event(rx: &mut mpsc::Receiver<String>) -> DialogServerEvent {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed");
    serde_json::from_str(&frame).expect("frame should decode")
}

/// Join the conference for a dialog and finish transport negotiation,
/// exactly as the WebSocket dispatch path does.
async fn join_ready(
    harness: &Harness,
    dialog_id: &str,
    connection_id: &str,
    user_id: &str,
) -> (ConferenceRoomHandle, ConnectionHandle, mpsc::Receiver<String>) {
    let (conn, rx) = connect(harness, connection_id, user_id);
    let room = harness
        .registry
        .conference_room(dialog_id.to_string(), user_id.to_string())
        .await
        .unwrap();
    room.join(
        user_id.to_string(),
        connection_id.to_string(),
        conn.clone(),
    )
    .await
    .unwrap();

    let transport_id = harness
        .media
        .create_transport(dialog_id, user_id)
        .await
        .unwrap();
    room.set_transport(user_id.to_string(), transport_id)
        .await
        .unwrap();

    let transport_id = room.begin_connect(user_id.to_string()).await.unwrap();
    harness
        .media
        .connect_transport(&transport_id, &json!({"fingerprint": "aa:bb"}))
        .await
        .unwrap();
    room.commit_connect(user_id.to_string()).await.unwrap();

    (room, conn, rx)
}

/// Produce a track through the begin/commit exchange.
async fn produce(
    harness: &Harness,
    room: &ConferenceRoomHandle,
    user_id: &str,
    kind: ProducerKind,
) -> String {
    let transport_id = room.begin_produce(user_id.to_string(), kind).await.unwrap();
    let producer_id = harness
        .media
        .create_producer(&transport_id, kind, &json!({"codecs": []}))
        .await
        .unwrap();
    room.commit_produce(user_id.to_string(), kind, producer_id.clone())
        .await
        .unwrap();
    producer_id
}

/// Consume a producer through the begin/commit exchange.
async fn consume(
    harness: &Harness,
    room: &ConferenceRoomHandle,
    user_id: &str,
    producer_id: &str,
) -> (String, ProducerKind) {
    let grant = room
        .begin_consume(user_id.to_string(), producer_id.to_string())
        .await
        .unwrap();
    let consumer_id = harness
        .media
        .create_consumer(&grant.transport_id, producer_id)
        .await
        .unwrap();
    let kind = room
        .commit_consume(
            user_id.to_string(),
            producer_id.to_string(),
            consumer_id.clone(),
        )
        .await
        .unwrap();
    (consumer_id, kind)
}

/// Close released resources against the media plane, as the socket
/// teardown path does.
async fn close_released(harness: &Harness, released: ReleasedMedia) {
    for consumer_id in &released.consumer_ids {
        let _ = harness.media.close_consumer(consumer_id).await;
    }
    for producer_id in &released.producer_ids {
        let _ = harness.media.close_producer(producer_id).await;
    }
    if let Some(transport_id) = &released.transport_id {
        let _ = harness.media.close_transport(transport_id).await;
    }
}

#[tokio::test]
async fn test_produce_consume_across_participants() {
    let harness = spawn_harness();
    let (room1, _c1, mut rx1) = join_ready(&harness, "d1", "c1", "u1").await;
    let (room2, _c2, mut rx2) = join_ready(&harness, "d1", "c2", "u2").await;

    assert!(matches!(
        next_conference_event(&mut rx1).await,
        ConferenceServerEvent::UserJoined { .. }
    ));

    let producer_id = produce(&harness, &room1, "u1", ProducerKind::Audio).await;

    let ConferenceServerEvent::NewProducer {
        user_id,
        producer_id: announced,
        kind,
    } = next_conference_event(&mut rx2).await
    else {
        panic!("expected new_producer");
    };
    assert_eq!(user_id, "u1");
    assert_eq!(announced, producer_id);
    assert_eq!(kind, ProducerKind::Audio);

    let (consumer_id, kind) = consume(&harness, &room2, "u2", &producer_id).await;
    assert_eq!(kind, ProducerKind::Audio);
    assert_eq!(harness.media.open_consumers(), 1);

    // Consumers start paused; resuming flows media.
    room2
        .resume_consumer("u2".to_string(), consumer_id.clone())
        .await
        .unwrap();
    harness.media.resume_consumer(&consumer_id).await.unwrap();
}

#[tokio::test]
async fn test_leave_tears_down_producers_and_peer_consumers() {
    let harness = spawn_harness();
    let (room1, _c1, mut rx1) = join_ready(&harness, "d1", "c1", "u1").await;
    let (room2, _c2, mut rx2) = join_ready(&harness, "d1", "c2", "u2").await;
    let _ = next_conference_event(&mut rx1).await; // u2 joined

    let audio = produce(&harness, &room1, "u1", ProducerKind::Audio).await;
    let screen = produce(&harness, &room1, "u1", ProducerKind::Screen).await;

    let _ = next_conference_event(&mut rx2).await; // new_producer audio
    // Screen shares announce themselves before the producer event.
    assert!(matches!(
        next_conference_event(&mut rx2).await,
        ConferenceServerEvent::ScreenShareStarted { .. }
    ));
    let _ = next_conference_event(&mut rx2).await; // new_producer screen

    let (_consumer, _) = consume(&harness, &room2, "u2", &audio).await;
    assert_eq!(harness.media.open_producers(), 2);
    assert_eq!(harness.media.open_consumers(), 1);

    let released = room1.leave("u1".to_string()).await.unwrap();
    assert!(released.transport_id.is_some());
    assert_eq!(released.producer_ids.len(), 2);
    assert!(released.producer_ids.contains(&audio));
    assert!(released.producer_ids.contains(&screen));
    assert_eq!(released.consumer_ids.len(), 1, "peer consumer released");
    close_released(&harness, released).await;

    assert_eq!(harness.media.open_producers(), 0);
    assert_eq!(harness.media.open_consumers(), 0);
    assert_eq!(harness.media.open_transports(), 1, "u2's transport stays");

    // u2 hears the teardown in order: consumer, screen share, departure.
    assert!(matches!(
        next_conference_event(&mut rx2).await,
        ConferenceServerEvent::ConsumerClosed { .. }
    ));
    assert!(matches!(
        next_conference_event(&mut rx2).await,
        ConferenceServerEvent::ScreenShareStopped { .. }
    ));
    assert!(matches!(
        next_conference_event(&mut rx2).await,
        ConferenceServerEvent::UserLeft { .. }
    ));

    let released = room2.leave("u2".to_string()).await.unwrap();
    close_released(&harness, released).await;
    assert_eq!(harness.media.open_transports(), 0);
}

#[tokio::test]
async fn test_disconnect_mid_conference_releases_media() {
    let harness = spawn_harness();
    let (room1, _c1, mut rx1) = join_ready(&harness, "d1", "c1", "u1").await;
    let (_room2, _c2, _rx2) = join_ready(&harness, "d1", "c2", "u2").await;
    let _ = next_conference_event(&mut rx1).await; // u2 joined

    let _producer = produce(&harness, &room1, "u1", ProducerKind::Video).await;
    assert_eq!(harness.media.open_producers(), 1);

    // u1's socket dies without a leave frame.
    harness.table.unregister("u1", "c1");
    let released_list = harness.registry.connection_closed("c1".to_string()).await;
    assert_eq!(released_list.len(), 1);
    for released in released_list {
        close_released(&harness, released).await;
    }

    assert_eq!(harness.media.open_producers(), 0);
    assert_eq!(harness.media.open_transports(), 1);
}

#[tokio::test]
async fn test_kick_requires_moderator_and_releases_target_media() {
    let harness = spawn_harness();
    let (room1, _c1, mut rx1) = join_ready(&harness, "d1", "c1", "u1").await;
    let (room2, _c2, mut rx2) = join_ready(&harness, "d1", "c2", "u2").await;
    let _ = next_conference_event(&mut rx1).await; // u2 joined

    let _producer = produce(&harness, &room2, "u2", ProducerKind::Audio).await;
    let _ = next_conference_event(&mut rx1).await; // new_producer

    let kick = Signal::ModeratorAction {
        action: ModeratorActionKind::Kick,
        target_user_id: "u2".to_string(),
    };

    // Without the moderator bit the relay is refused.
    let err = room1
        .relay("u1".to_string(), kick.clone(), false)
        .await
        .unwrap_err();
    assert_eq!(err.wire_tag(), "forbidden");

    let released = room1.relay("u1".to_string(), kick, true).await.unwrap();
    assert!(released.transport_id.is_some());
    assert_eq!(released.producer_ids.len(), 1);
    close_released(&harness, released).await;

    // The target saw the kick signal before teardown.
    assert!(matches!(
        next_conference_event(&mut rx2).await,
        ConferenceServerEvent::Signal { .. }
    ));

    assert_eq!(harness.media.open_producers(), 0);
    assert_eq!(harness.media.open_transports(), 1, "u1's transport stays");
}

#[tokio::test]
async fn test_conference_lifecycle_is_announced_in_the_dialog() {
    let harness = spawn_harness();
    harness.store.seed_dialog("d1", "Pair", &["u1", "u2"]);

    // u2 sits in the dialog room without joining the call.
    let dialog = harness
        .registry
        .dialog_room("d1".to_string())
        .await
        .unwrap();
    let (conn2, mut dialog_rx2) = connect(&harness, "c2", "u2");
    dialog
        .join("c2".to_string(), "u2".to_string(), conn2, Pagination::default())
        .await
        .unwrap();

    let (room1, _c1, _rx1) = join_ready(&harness, "d1", "c1", "u1").await;

    let DialogServerEvent::VideoConferenceStarted {
        dialog_id,
        initiator_id,
    } = next_dialog_event(&mut dialog_rx2).await
    else {
        panic!("expected conference start announcement");
    };
    assert_eq!(dialog_id, "d1");
    assert_eq!(initiator_id, "u1");

    let released = room1.leave("u1".to_string()).await.unwrap();
    close_released(&harness, released).await;

    let DialogServerEvent::VideoConferenceEnded { initiator_id, .. } =
        next_dialog_event(&mut dialog_rx2).await
    else {
        panic!("expected conference end announcement");
    };
    assert_eq!(initiator_id, "u1");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = harness.registry.status().await.unwrap();
    assert_eq!(status.conference_rooms, 0);
    assert_eq!(harness.media.open_transports(), 0);
}
