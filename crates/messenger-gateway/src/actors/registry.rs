//! `RegistryActor`: the singleton that owns every live room.
//!
//! Two independent maps, both keyed by dialog id: one for dialog rooms,
//! one for conference rooms. A dialog can have either, both or neither.
//! Rooms are created on first join and torn down when they report empty;
//! conference lifecycle transitions are announced to the owning dialog
//! room from here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use messenger_protocol::dialog::DialogServerEvent;

use crate::actors::conference::{ConferenceRoomActor, ConferenceRoomHandle};
use crate::actors::dialog::{DialogRoomActor, DialogRoomHandle};
use crate::actors::messages::{
    RegistryMessage, RegistryStatus, ReleasedMedia, RoomKind,
};
use crate::actors::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::config::RoomConfig;
use crate::connections::ConnectionTable;
use crate::errors::GatewayError;
use crate::store::MessageStore;

/// Buffer size for the registry mailbox. Generous: rooms report
/// `RoomEmpty` into this mailbox while the registry may be mid-request.
const REGISTRY_CHANNEL_BUFFER: usize = 1024;

/// How often finished room tasks are reaped.
const ROOM_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// How long shutdown waits for rooms to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct ManagedDialogRoom {
    handle: DialogRoomHandle,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

struct ManagedConferenceRoom {
    handle: ConferenceRoomHandle,
    task: JoinHandle<()>,
    cancel: CancellationToken,
    /// First joiner; echoed in conference lifecycle events.
    initiator_id: String,
}

/// Handle for interacting with the `RegistryActor`.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryHandle {
    /// Get or create the dialog room for a dialog.
    pub async fn dialog_room(&self, dialog_id: String) -> Result<DialogRoomHandle, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::DialogRoom {
                dialog_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up a dialog room without creating it.
    pub async fn find_dialog_room(
        &self,
        dialog_id: String,
    ) -> Result<Option<DialogRoomHandle>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::FindDialogRoom {
                dialog_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))
    }

    /// Get or create the conference room for a dialog. The caller must
    /// have verified the user's dialog membership first.
    pub async fn conference_room(
        &self,
        dialog_id: String,
        user_id: String,
    ) -> Result<ConferenceRoomHandle, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::ConferenceRoom {
                dialog_id,
                user_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Sweep a closed connection out of every room. Returns the media
    /// released by conference sweeps for the caller to close.
    pub async fn connection_closed(&self, connection_id: String) -> Vec<ReleasedMedia> {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(RegistryMessage::ConnectionClosed {
                connection_id,
                respond_to: tx,
            })
            .await;
        if sent.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Registry status for the readiness endpoint.
    pub async fn status(&self) -> Result<RegistryStatus, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Status { respond_to: tx })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))
    }

    /// Drain and tear down all rooms.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.cancel_token.cancel();
    }
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Sender cloned into rooms so they can report `RoomEmpty`.
    self_sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    dialog_rooms: HashMap<String, ManagedDialogRoom>,
    conference_rooms: HashMap<String, ManagedConferenceRoom>,
    store: Arc<dyn MessageStore>,
    connections: Arc<ConnectionTable>,
    config: RoomConfig,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
    draining: bool,
}

impl RegistryActor {
    /// Spawn the registry actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        cancel_token: CancellationToken,
        store: Arc<dyn MessageStore>,
        connections: Arc<ConnectionTable>,
        config: RoomConfig,
        metrics: Arc<ActorMetrics>,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = Self {
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            dialog_rooms: HashMap::new(),
            conference_rooms: HashMap::new(),
            store,
            connections,
            config,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
            draining: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "gw.actor.registry")]
    async fn run(mut self) {
        info!(target: "gw.actor.registry", "RegistryActor started");

        let mut reap = tokio::time::interval(ROOM_REAP_INTERVAL);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "gw.actor.registry",
                        "RegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = reap.tick() => {
                    self.reap_finished_rooms();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "gw.actor.registry",
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "gw.actor.registry",
            dialog_rooms = self.dialog_rooms.len(),
            conference_rooms = self.conference_rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RegistryMessage) -> bool {
        match message {
            RegistryMessage::DialogRoom {
                dialog_id,
                respond_to,
            } => {
                let result = self.get_or_create_dialog_room(&dialog_id);
                let _ = respond_to.send(result);
                false
            }

            RegistryMessage::FindDialogRoom {
                dialog_id,
                respond_to,
            } => {
                let handle = self
                    .dialog_rooms
                    .get(&dialog_id)
                    .map(|room| room.handle.clone());
                let _ = respond_to.send(handle);
                false
            }

            RegistryMessage::ConferenceRoom {
                dialog_id,
                user_id,
                respond_to,
            } => {
                let result = self.get_or_create_conference_room(&dialog_id, &user_id).await;
                let _ = respond_to.send(result);
                false
            }

            RegistryMessage::RoomEmpty { dialog_id, kind } => {
                self.handle_room_empty(&dialog_id, kind).await;
                false
            }

            RegistryMessage::ConnectionClosed {
                connection_id,
                respond_to,
            } => {
                let released = self.handle_connection_closed(&connection_id).await;
                let _ = respond_to.send(released);
                false
            }

            RegistryMessage::Status { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    dialog_rooms: self.dialog_rooms.len(),
                    conference_rooms: self.conference_rooms.len(),
                    draining: self.draining,
                });
                false
            }

            RegistryMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                let _ = respond_to.send(());
                true
            }
        }
    }

    fn get_or_create_dialog_room(
        &mut self,
        dialog_id: &str,
    ) -> Result<DialogRoomHandle, GatewayError> {
        if self.draining {
            return Err(GatewayError::Draining);
        }

        if let Some(room) = self.dialog_rooms.get(dialog_id) {
            return Ok(room.handle.clone());
        }

        let cancel = self.cancel_token.child_token();
        let (handle, task) = DialogRoomActor::spawn(
            dialog_id.to_string(),
            cancel.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.connections),
            self.self_sender.clone(),
            self.config,
            Arc::clone(&self.metrics),
        );

        debug!(
            target: "gw.actor.registry",
            dialog_id = %dialog_id,
            "Created dialog room"
        );

        self.dialog_rooms.insert(
            dialog_id.to_string(),
            ManagedDialogRoom {
                handle: handle.clone(),
                task,
                cancel,
            },
        );
        Ok(handle)
    }

    async fn get_or_create_conference_room(
        &mut self,
        dialog_id: &str,
        user_id: &str,
    ) -> Result<ConferenceRoomHandle, GatewayError> {
        if self.draining {
            return Err(GatewayError::Draining);
        }

        if let Some(room) = self.conference_rooms.get(dialog_id) {
            return Ok(room.handle.clone());
        }

        let cancel = self.cancel_token.child_token();
        let (handle, task) = ConferenceRoomActor::spawn(
            dialog_id.to_string(),
            cancel.clone(),
            self.self_sender.clone(),
            Arc::clone(&self.metrics),
        );

        info!(
            target: "gw.actor.registry",
            dialog_id = %dialog_id,
            initiator_id = %user_id,
            "Conference started"
        );

        self.conference_rooms.insert(
            dialog_id.to_string(),
            ManagedConferenceRoom {
                handle: handle.clone(),
                task,
                cancel,
                initiator_id: user_id.to_string(),
            },
        );

        // Announce to dialog members who are not in the call.
        if let Some(dialog) = self.dialog_rooms.get(dialog_id) {
            dialog
                .handle
                .broadcast(DialogServerEvent::VideoConferenceStarted {
                    dialog_id: dialog_id.to_string(),
                    initiator_id: user_id.to_string(),
                })
                .await;
        }

        Ok(handle)
    }

    async fn handle_room_empty(&mut self, dialog_id: &str, kind: RoomKind) {
        match kind {
            RoomKind::Dialog => {
                if let Some(room) = self.dialog_rooms.remove(dialog_id) {
                    room.cancel.cancel();
                    debug!(
                        target: "gw.actor.registry",
                        dialog_id = %dialog_id,
                        "Dialog room torn down"
                    );
                }
            }
            RoomKind::Conference => {
                if let Some(room) = self.conference_rooms.remove(dialog_id) {
                    room.cancel.cancel();
                    info!(
                        target: "gw.actor.registry",
                        dialog_id = %dialog_id,
                        "Conference ended"
                    );
                    if let Some(dialog) = self.dialog_rooms.get(dialog_id) {
                        dialog
                            .handle
                            .broadcast(DialogServerEvent::VideoConferenceEnded {
                                dialog_id: dialog_id.to_string(),
                                initiator_id: room.initiator_id,
                            })
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_connection_closed(&mut self, connection_id: &str) -> Vec<ReleasedMedia> {
        for room in self.dialog_rooms.values() {
            room.handle.disconnected(connection_id.to_string()).await;
        }

        let mut released = Vec::new();
        let conference_handles: Vec<ConferenceRoomHandle> = self
            .conference_rooms
            .values()
            .map(|room| room.handle.clone())
            .collect();
        for handle in conference_handles {
            let media = handle.disconnected(connection_id.to_string()).await;
            if !media.is_empty() {
                released.push(media);
            }
        }
        released
    }

    /// Remove rooms whose tasks stopped on their own (cancelled or
    /// panicked). A panic is counted; the room state is gone either way.
    fn reap_finished_rooms(&mut self) {
        let dead_dialogs: Vec<String> = self
            .dialog_rooms
            .iter()
            .filter(|(_, room)| room.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for dialog_id in dead_dialogs {
            warn!(
                target: "gw.actor.registry",
                dialog_id = %dialog_id,
                "Dialog room task finished unexpectedly, removing"
            );
            self.metrics.record_panic();
            self.dialog_rooms.remove(&dialog_id);
        }

        let dead_conferences: Vec<String> = self
            .conference_rooms
            .iter()
            .filter(|(_, room)| room.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for dialog_id in dead_conferences {
            warn!(
                target: "gw.actor.registry",
                dialog_id = %dialog_id,
                "Conference room task finished unexpectedly, removing"
            );
            self.metrics.record_panic();
            self.conference_rooms.remove(&dialog_id);
        }
    }

    /// Cancel every room and wait (bounded) for their tasks to stop.
    async fn graceful_shutdown(&mut self) {
        self.draining = true;
        info!(
            target: "gw.actor.registry",
            dialog_rooms = self.dialog_rooms.len(),
            conference_rooms = self.conference_rooms.len(),
            "Registry draining"
        );

        for room in self.conference_rooms.values() {
            room.cancel.cancel();
        }
        for room in self.dialog_rooms.values() {
            room.cancel.cancel();
        }

        for (dialog_id, room) in self.conference_rooms.drain() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, room.task).await.is_err() {
                warn!(
                    target: "gw.actor.registry",
                    dialog_id = %dialog_id,
                    "Conference room did not stop within shutdown timeout"
                );
            }
        }
        for (dialog_id, room) in self.dialog_rooms.drain() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, room.task).await.is_err() {
                warn!(
                    target: "gw.actor.registry",
                    dialog_id = %dialog_id,
                    "Dialog room did not stop within shutdown timeout"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::connection::{ConnectionActor, ConnectionHandle};
    use crate::store::InMemoryStore;
    use common::types::Pagination;

    struct TestRegistry {
        handle: RegistryHandle,
        store: Arc<InMemoryStore>,
        table: Arc<ConnectionTable>,
        metrics: Arc<ActorMetrics>,
    }

    fn spawn_registry() -> TestRegistry {
        let store = Arc::new(InMemoryStore::new());
        let table = Arc::new(ConnectionTable::new());
        let metrics = ActorMetrics::new();
        let (handle, _task) = RegistryActor::spawn(
            CancellationToken::new(),
            Arc::clone(&store) as Arc<dyn MessageStore>,
            Arc::clone(&table),
            RoomConfig::default(),
            Arc::clone(&metrics),
        );
        TestRegistry {
            handle,
            store,
            table,
            metrics,
        }
    }

    fn test_connection(
        registry: &TestRegistry,
        connection_id: &str,
        user_id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<String>) {
        registry.table.register(user_id, connection_id);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (handle, _task) = ConnectionActor::spawn(
            connection_id.to_string(),
            user_id.to_string(),
            outbound_tx,
            CancellationToken::new(),
            Arc::clone(&registry.metrics),
            64,
        );
        (handle, outbound_rx)
    }

    #[tokio::test]
    async fn test_dialog_room_reused_until_empty() {
        let registry = spawn_registry();
        registry.store.seed_dialog("d1", "Pals", &["u1"]);

        let first = registry.handle.dialog_room("d1".to_string()).await.unwrap();
        let second = registry.handle.dialog_room("d1".to_string()).await.unwrap();
        assert_eq!(first.dialog_id(), second.dialog_id());

        let status = registry.handle.status().await.unwrap();
        assert_eq!(status.dialog_rooms, 1);
    }

    #[tokio::test]
    async fn test_empty_dialog_room_torn_down() {
        let registry = spawn_registry();
        registry.store.seed_dialog("d1", "Pals", &["u1"]);
        let (conn, _rx) = test_connection(&registry, "c1", "u1");

        let room = registry.handle.dialog_room("d1".to_string()).await.unwrap();
        room.join(
            "c1".to_string(),
            "u1".to_string(),
            conn,
            Pagination::default(),
        )
        .await
        .unwrap();
        room.leave("c1".to_string()).await.unwrap();

        // The registry processes RoomEmpty and drops the room.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = registry.handle.status().await.unwrap();
        assert_eq!(status.dialog_rooms, 0);
    }

    #[tokio::test]
    async fn test_conference_lifecycle_announced_to_dialog() {
        let registry = spawn_registry();
        registry.store.seed_dialog("d1", "Pals", &["u1", "u2"]);

        // u2 sits in the dialog room and observes lifecycle events.
        let (dialog_conn, mut dialog_rx) = test_connection(&registry, "c2", "u2");
        let dialog = registry.handle.dialog_room("d1".to_string()).await.unwrap();
        dialog
            .join(
                "c2".to_string(),
                "u2".to_string(),
                dialog_conn,
                Pagination::default(),
            )
            .await
            .unwrap();

        // u1 starts the conference.
        let (conf_conn, _conf_rx) = test_connection(&registry, "c1", "u1");
        let conference = registry
            .handle
            .conference_room("d1".to_string(), "u1".to_string())
            .await
            .unwrap();
        conference
            .join("u1".to_string(), "c1".to_string(), conf_conn)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), dialog_rx.recv())
            .await
            .expect("expected conference start announcement")
            .unwrap();
        let event: DialogServerEvent = serde_json::from_str(&frame).unwrap();
        assert!(matches!(
            event,
            DialogServerEvent::VideoConferenceStarted { .. }
        ));

        // Last participant leaves; the end is announced too.
        conference.leave("u1".to_string()).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), dialog_rx.recv())
            .await
            .expect("expected conference end announcement")
            .unwrap();
        let event: DialogServerEvent = serde_json::from_str(&frame).unwrap();
        let DialogServerEvent::VideoConferenceEnded { initiator_id, .. } = event else {
            panic!("expected video_conference_ended");
        };
        assert_eq!(initiator_id, "u1");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = registry.handle.status().await.unwrap();
        assert_eq!(status.conference_rooms, 0);
    }

    #[tokio::test]
    async fn test_connection_closed_sweeps_rooms() {
        let registry = spawn_registry();
        registry.store.seed_dialog("d1", "Pals", &["u1", "u2"]);

        let (c1, _rx1) = test_connection(&registry, "c1", "u1");
        let (c2, _rx2) = test_connection(&registry, "c2", "u2");
        let room = registry.handle.dialog_room("d1".to_string()).await.unwrap();
        room.join(
            "c1".to_string(),
            "u1".to_string(),
            c1,
            Pagination::default(),
        )
        .await
        .unwrap();
        room.join(
            "c2".to_string(),
            "u2".to_string(),
            c2,
            Pagination::default(),
        )
        .await
        .unwrap();

        registry.table.unregister("u1", "c1");
        registry.handle.connection_closed("c1".to_string()).await;

        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(snapshot.active_participants, vec!["u2"]);
    }

    #[tokio::test]
    async fn test_draining_rejects_new_rooms() {
        let registry = spawn_registry();
        registry.store.seed_dialog("d1", "Pals", &["u1"]);
        registry.handle.shutdown().await;

        let result = registry.handle.dialog_room("d1".to_string()).await;
        assert!(
            matches!(result, Err(GatewayError::Draining) | Err(GatewayError::Internal(_))),
            "draining registry must not hand out rooms"
        );
    }
}
