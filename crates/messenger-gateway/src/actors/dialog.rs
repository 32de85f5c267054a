//! `DialogRoomActor`: one per dialog with at least one live connection.
//!
//! Owns the dialog's volatile state: member connections, typing
//! indicators and the cached list-view summary. All persistence goes
//! through the store seam with a bounded timeout, and a message is
//! broadcast only after its store write commits, so fan-out order always
//! matches commit order.

use common::types::Pagination;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use common::types::PresenceStatus;
use messenger_protocol::dialog::{CreateMessage, DialogServerEvent, MediaRef, MessageRecord};

use crate::actors::connection::ConnectionHandle;
use crate::actors::messages::{
    DialogJoinReply, DialogRoomMessage, DialogRoomSnapshot, ReceiptKind, RegistryMessage, RoomKind,
};
use crate::actors::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::config::RoomConfig;
use crate::connections::ConnectionTable;
use crate::errors::GatewayError;
use crate::presence::broadcast_event;
use crate::store::{call_with_timeout, MessageStore, NewMessage};

/// Buffer size for dialog room mailboxes.
const DIALOG_CHANNEL_BUFFER: usize = 256;

/// Handle for interacting with a `DialogRoomActor`.
#[derive(Debug, Clone)]
pub struct DialogRoomHandle {
    sender: mpsc::Sender<DialogRoomMessage>,
    cancel_token: CancellationToken,
    dialog_id: String,
}

impl DialogRoomHandle {
    /// Join the room with a connection and get a history page back.
    pub async fn join(
        &self,
        connection_id: String,
        user_id: String,
        connection: ConnectionHandle,
        pagination: Pagination,
    ) -> Result<DialogJoinReply, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DialogRoomMessage::Join {
                connection_id,
                user_id,
                connection,
                pagination,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the room explicitly.
    pub async fn leave(&self, connection_id: String) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DialogRoomMessage::Leave {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Notify that a connection dropped without leaving.
    pub async fn disconnected(&self, connection_id: String) {
        let _ = self
            .sender
            .send(DialogRoomMessage::Disconnected { connection_id })
            .await;
    }

    /// Persist and fan out a message.
    pub async fn send_message(
        &self,
        connection_id: String,
        message: CreateMessage,
        media: Vec<MediaRef>,
    ) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DialogRoomMessage::Send {
                connection_id,
                message,
                media,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Typing indicator on/off.
    pub async fn set_typing(
        &self,
        connection_id: String,
        is_typing: bool,
    ) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DialogRoomMessage::SetTyping {
                connection_id,
                is_typing,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Apply delivery/read receipts.
    pub async fn receipt(
        &self,
        connection_id: String,
        kind: ReceiptKind,
        message_ids: Vec<String>,
    ) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DialogRoomMessage::Receipt {
                connection_id,
                kind,
                message_ids,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Whether a user has a live connection in this room.
    pub async fn is_member(&self, user_id: String) -> Result<bool, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DialogRoomMessage::IsMember {
                user_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))
    }

    /// Fan an event out to every member connection.
    pub async fn broadcast(&self, event: DialogServerEvent) {
        let _ = self
            .sender
            .send(DialogRoomMessage::Broadcast { event })
            .await;
    }

    /// Snapshot for tests and the status endpoint.
    pub async fn snapshot(&self) -> Result<DialogRoomSnapshot, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DialogRoomMessage::Snapshot { respond_to: tx })
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn dialog_id(&self) -> &str {
        &self.dialog_id
    }
}

/// The `DialogRoomActor` implementation.
pub struct DialogRoomActor {
    dialog_id: String,
    receiver: mpsc::Receiver<DialogRoomMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    /// Member connections, keyed by connection id. A user with several
    /// devices appears once per connection.
    members: HashMap<String, ConnectionHandle>,
    /// Users currently typing and when their indicator was last refreshed.
    typing: HashMap<String, Instant>,
    /// When each user was last active here (join, message, typing,
    /// receipt, leave). Wall-clock time, since it is reported to clients.
    last_seen: HashMap<String, chrono::DateTime<chrono::Utc>>,
    /// Cached list-view summary for change detection.
    last_image: Option<Option<String>>,
    last_message_id: Option<String>,
    store: Arc<dyn MessageStore>,
    connections: Arc<ConnectionTable>,
    registry: mpsc::Sender<RegistryMessage>,
    config: RoomConfig,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl DialogRoomActor {
    /// Spawn a new dialog room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        dialog_id: String,
        cancel_token: CancellationToken,
        store: Arc<dyn MessageStore>,
        connections: Arc<ConnectionTable>,
        registry: mpsc::Sender<RegistryMessage>,
        config: RoomConfig,
        metrics: Arc<ActorMetrics>,
    ) -> (DialogRoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(DIALOG_CHANNEL_BUFFER);

        let actor = Self {
            dialog_id: dialog_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            members: HashMap::new(),
            typing: HashMap::new(),
            last_seen: HashMap::new(),
            last_image: None,
            last_message_id: None,
            store,
            connections,
            registry,
            config,
            metrics: Arc::clone(&metrics),
            mailbox: MailboxMonitor::new(ActorType::DialogRoom, &dialog_id),
        };

        metrics.dialog_room_opened();
        let task_handle = tokio::spawn(actor.run());

        let handle = DialogRoomHandle {
            sender,
            cancel_token,
            dialog_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "gw.actor.dialog", fields(dialog_id = %self.dialog_id))]
    async fn run(mut self) {
        info!(
            target: "gw.actor.dialog",
            dialog_id = %self.dialog_id,
            "DialogRoomActor started"
        );

        // Sweep for expired typing indicators
        let mut typing_sweep = tokio::time::interval(self.config.typing_sweep_interval);
        typing_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "gw.actor.dialog",
                        dialog_id = %self.dialog_id,
                        "DialogRoomActor received cancellation signal"
                    );
                    break;
                }

                _ = typing_sweep.tick() => {
                    self.sweep_typing();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "gw.actor.dialog",
                                dialog_id = %self.dialog_id,
                                "DialogRoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.dialog_room_closed();
        info!(
            target: "gw.actor.dialog",
            dialog_id = %self.dialog_id,
            members = self.members.len(),
            messages_processed = self.mailbox.messages_processed(),
            "DialogRoomActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: DialogRoomMessage) {
        match message {
            DialogRoomMessage::Join {
                connection_id,
                user_id,
                connection,
                pagination,
                respond_to,
            } => {
                let result = self
                    .handle_join(connection_id, user_id, connection, pagination)
                    .await;
                let _ = respond_to.send(result);
            }

            DialogRoomMessage::Leave {
                connection_id,
                respond_to,
            } => {
                let result = self.handle_leave(&connection_id).await;
                let _ = respond_to.send(result);
            }

            DialogRoomMessage::Disconnected { connection_id } => {
                // Best effort: an unknown connection is already gone.
                let _ = self.handle_leave(&connection_id).await;
            }

            DialogRoomMessage::Send {
                connection_id,
                message,
                media,
                respond_to,
            } => {
                let result = self.handle_send(&connection_id, message, media).await;
                let _ = respond_to.send(result);
            }

            DialogRoomMessage::SetTyping {
                connection_id,
                is_typing,
                respond_to,
            } => {
                let result = self.handle_set_typing(&connection_id, is_typing);
                let _ = respond_to.send(result);
            }

            DialogRoomMessage::Receipt {
                connection_id,
                kind,
                message_ids,
                respond_to,
            } => {
                let result = self.handle_receipt(&connection_id, kind, message_ids).await;
                let _ = respond_to.send(result);
            }

            DialogRoomMessage::IsMember {
                user_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.user_is_active(&user_id));
            }

            DialogRoomMessage::Broadcast { event } => {
                self.broadcast_all(&event);
            }

            DialogRoomMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(DialogRoomSnapshot {
                    member_connections: self.members.len(),
                    active_participants: self.active_participants(),
                    typing_users: self.typing.keys().cloned().collect(),
                    last_seen: self.last_seen.clone(),
                });
            }
        }
    }

    /// Handle a join. Idempotent per connection: re-joining returns a
    /// fresh history page without duplicating membership or presence.
    async fn handle_join(
        &mut self,
        connection_id: String,
        user_id: String,
        connection: ConnectionHandle,
        pagination: Pagination,
    ) -> Result<DialogJoinReply, GatewayError> {
        let was_member = self.members.contains_key(&connection_id);
        let user_was_active = self.user_is_active(&user_id);

        self.members.insert(connection_id.clone(), connection);
        self.touch(&user_id);

        let history = call_with_timeout(
            self.config.persistence_timeout,
            self.store
                .load_history(&self.dialog_id, pagination.offset(), pagination.per_page),
        )
        .await;

        let page = match history {
            Ok(page) => page,
            Err(err) => {
                // Roll the membership back so a failed join leaves no trace.
                if !was_member {
                    self.members.remove(&connection_id);
                    self.notify_if_empty().await;
                }
                return Err(err);
            }
        };

        if let Some(last) = page.messages.last() {
            self.last_message_id.get_or_insert_with(|| last.id.clone());
        }

        let active = self.active_participants();
        if !user_was_active {
            self.broadcast_except(
                &connection_id,
                &DialogServerEvent::UserStatusChanged {
                    user_id: user_id.clone(),
                    status: PresenceStatus::Online,
                    active_participants: Some(active.clone()),
                },
            );
        }

        debug!(
            target: "gw.actor.dialog",
            dialog_id = %self.dialog_id,
            connection_id = %connection_id,
            user_id = %user_id,
            rejoin = was_member,
            "Connection joined dialog"
        );

        Ok(DialogJoinReply {
            messages: page.messages,
            participants: page.participants,
            active_participants: active,
        })
    }

    /// Handle an explicit leave or a disconnect sweep.
    async fn handle_leave(&mut self, connection_id: &str) -> Result<(), GatewayError> {
        let Some(connection) = self.members.remove(connection_id) else {
            return Err(GatewayError::NotAMember(self.dialog_id.clone()));
        };
        let user_id = connection.profile_id().to_string();
        self.touch(&user_id);

        if !self.user_is_active(&user_id) {
            // Last connection of this user left the room.
            if self.typing.remove(&user_id).is_some() {
                self.broadcast_all(&DialogServerEvent::UserTyping {
                    user_id: user_id.clone(),
                    is_typing: false,
                });
            }
            let status = self.connections.presence(&user_id);
            self.broadcast_all(&DialogServerEvent::UserStatusChanged {
                user_id,
                status,
                active_participants: Some(self.active_participants()),
            });
        }

        self.notify_if_empty().await;
        Ok(())
    }

    /// Persist a message, then fan it out in commit order.
    async fn handle_send(
        &mut self,
        connection_id: &str,
        message: CreateMessage,
        media: Vec<MediaRef>,
    ) -> Result<(), GatewayError> {
        let Some(connection) = self.members.get(connection_id) else {
            return Err(GatewayError::NotAMember(self.dialog_id.clone()));
        };
        let author_id = connection.profile_id().to_string();
        self.touch(&author_id);

        let saved = call_with_timeout(
            self.config.persistence_timeout,
            self.store.save_message(NewMessage {
                dialog_id: self.dialog_id.clone(),
                author_id: author_id.clone(),
                text: message.text,
                media,
                reply_to_id: message.reply_to_id,
                forwarded_from_id: message.forwarded_from_id,
            }),
        )
        .await?;

        // Sending implies the author stopped typing.
        if self.typing.remove(&author_id).is_some() {
            self.broadcast_all(&DialogServerEvent::UserTyping {
                user_id: author_id,
                is_typing: false,
            });
        }

        self.last_message_id = Some(saved.id.clone());
        self.broadcast_all(&DialogServerEvent::NewMessage(saved));
        self.refresh_dialog_short().await;
        Ok(())
    }

    /// Recompute the list-view summary and push changes to members.
    async fn refresh_dialog_short(&mut self) {
        let short = match call_with_timeout(
            self.config.persistence_timeout,
            self.store.dialog_short(&self.dialog_id),
        )
        .await
        {
            Ok(short) => short,
            Err(err) => {
                // The message is already out; the summary catches up on
                // the next change.
                warn!(
                    target: "gw.actor.dialog",
                    dialog_id = %self.dialog_id,
                    error = %err,
                    "Failed to refresh dialog summary"
                );
                return;
            }
        };

        if self
            .last_image
            .as_ref()
            .is_some_and(|prev| *prev != short.image)
        {
            self.broadcast_all(&DialogServerEvent::DialogImageUpdated {
                dialog_id: self.dialog_id.clone(),
                image: short.image.clone(),
            });
        }
        self.last_image = Some(short.image.clone());

        self.broadcast_all(&DialogServerEvent::DialogShortUpdated(short));
    }

    /// Typing indicator on/off. Refreshing an already-live indicator
    /// extends its TTL without rebroadcasting.
    fn handle_set_typing(
        &mut self,
        connection_id: &str,
        is_typing: bool,
    ) -> Result<(), GatewayError> {
        let Some(connection) = self.members.get(connection_id) else {
            return Err(GatewayError::NotAMember(self.dialog_id.clone()));
        };
        let user_id = connection.profile_id().to_string();
        self.touch(&user_id);

        if is_typing {
            let was_typing = self.typing.insert(user_id.clone(), Instant::now()).is_some();
            if !was_typing {
                self.broadcast_except(
                    connection_id,
                    &DialogServerEvent::UserTyping {
                        user_id,
                        is_typing: true,
                    },
                );
            }
        } else if self.typing.remove(&user_id).is_some() {
            self.broadcast_except(
                connection_id,
                &DialogServerEvent::UserTyping {
                    user_id,
                    is_typing: false,
                },
            );
        }
        Ok(())
    }

    /// Expire typing indicators that were never explicitly stopped.
    fn sweep_typing(&mut self) {
        let ttl = self.config.typing_ttl;
        let expired: Vec<String> = self
            .typing
            .iter()
            .filter(|(_, started)| started.elapsed() > ttl)
            .map(|(user_id, _)| user_id.clone())
            .collect();

        for user_id in expired {
            self.typing.remove(&user_id);
            self.broadcast_all(&DialogServerEvent::UserTyping {
                user_id,
                is_typing: false,
            });
        }
    }

    /// Apply a batch of receipts. State transitions are monotonic; stale
    /// receipts are silently ignored.
    async fn handle_receipt(
        &mut self,
        connection_id: &str,
        kind: ReceiptKind,
        message_ids: Vec<String>,
    ) -> Result<(), GatewayError> {
        let Some(connection) = self.members.get(connection_id) else {
            return Err(GatewayError::NotAMember(self.dialog_id.clone()));
        };
        let reader_id = connection.profile_id().to_string();
        self.touch(&reader_id);

        let now = chrono::Utc::now();
        let mut last_message_update: Option<MessageRecord> = None;

        for message_id in message_ids {
            let updated = call_with_timeout(self.config.persistence_timeout, async {
                match kind {
                    ReceiptKind::Delivered => {
                        self.store
                            .mark_delivered(&self.dialog_id, &message_id, now)
                            .await
                    }
                    ReceiptKind::Read => {
                        self.store.mark_read(&self.dialog_id, &message_id, now).await
                    }
                }
            })
            .await?;

            if let Some(record) = updated {
                if self.last_message_id.as_deref() == Some(record.id.as_str()) {
                    last_message_update = Some(record);
                }
            }
        }

        // The list view only shows the newest message, so only a change
        // to it is worth pushing.
        if let Some(record) = last_message_update {
            self.broadcast_all(&DialogServerEvent::DialogLastMessageUpdated {
                dialog_id: self.dialog_id.clone(),
                last_message: record,
            });
        }
        Ok(())
    }

    /// Record activity from a user.
    fn touch(&mut self, user_id: &str) {
        self.last_seen
            .insert(user_id.to_string(), chrono::Utc::now());
    }

    /// Whether a user has at least one live connection in this room.
    fn user_is_active(&self, user_id: &str) -> bool {
        self.members
            .values()
            .any(|connection| connection.profile_id() == user_id)
    }

    /// Distinct user ids with a live connection, sorted for determinism.
    fn active_participants(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .members
            .values()
            .map(|connection| connection.profile_id().to_string())
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    fn broadcast_all(&self, event: &DialogServerEvent) {
        broadcast_event(self.members.values(), event);
    }

    fn broadcast_except(&self, skip_connection_id: &str, event: &DialogServerEvent) {
        broadcast_event(
            self.members
                .iter()
                .filter(|(id, _)| id.as_str() != skip_connection_id)
                .map(|(_, connection)| connection),
            event,
        );
    }

    /// Tell the registry when the last member is gone so the room can be
    /// torn down.
    async fn notify_if_empty(&self) {
        if self.members.is_empty() {
            let _ = self
                .registry
                .send(RegistryMessage::RoomEmpty {
                    dialog_id: self.dialog_id.clone(),
                    kind: RoomKind::Dialog,
                })
                .await;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    struct TestRoom {
        handle: DialogRoomHandle,
        store: Arc<InMemoryStore>,
        table: Arc<ConnectionTable>,
        registry_rx: mpsc::Receiver<RegistryMessage>,
        metrics: Arc<ActorMetrics>,
    }

    fn spawn_room(dialog_id: &str, participants: &[&str]) -> TestRoom {
        let store = Arc::new(InMemoryStore::new());
        store.seed_dialog(dialog_id, "Test Dialog", participants);
        let table = Arc::new(ConnectionTable::new());
        let (registry_tx, registry_rx) = mpsc::channel(16);
        let metrics = ActorMetrics::new();

        let (handle, _task) = DialogRoomActor::spawn(
            dialog_id.to_string(),
            CancellationToken::new(),
            Arc::clone(&store) as Arc<dyn MessageStore>,
            Arc::clone(&table),
            registry_tx,
            RoomConfig::default(),
            Arc::clone(&metrics),
        );

        TestRoom {
            handle,
            store,
            table,
            registry_rx,
            metrics,
        }
    }

    fn test_connection(
        room: &TestRoom,
        connection_id: &str,
        user_id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<String>) {
        room.table.register(user_id, connection_id);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (handle, _task) = ConnectionActor::spawn(
            connection_id.to_string(),
            user_id.to_string(),
            outbound_tx,
            CancellationToken::new(),
            Arc::clone(&room.metrics),
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

    async fn join(
        room: &TestRoom,
        connection_id: &str,
        user_id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<String>, DialogJoinReply) {
        let (conn, rx) = test_connection(room, connection_id, user_id);
        let reply = room
            .handle
            .join(
                connection_id.to_string(),
                user_id.to_string(),
                conn.clone(),
                Pagination::default(),
            )
            .await
            .unwrap();
        (conn, rx, reply)
    }

    #[tokio::test]
    async fn test_broadcast_relays_upstream_dialog_edits() {
        use messenger_protocol::dialog::{DialogEntity, DialogKind};

        let room = spawn_room("d1", &["u1", "u2"]);
        let (_c1, mut rx1, _) = join(&room, "c1", "u1").await;

        // An upstream CRUD edit arrives through the broadcast entry point.
        room.handle
            .broadcast(DialogServerEvent::DialogUpdated(DialogEntity {
                id: "d1".to_string(),
                title: "Renamed".to_string(),
                image: None,
                kind: DialogKind::Private,
                participants: vec!["u1".to_string(), "u2".to_string()],
            }))
            .await;

        let DialogServerEvent::DialogUpdated(entity) = next_event(&mut rx1).await else {
            panic!("expected dialog_updated");
        };
        assert_eq!(entity.title, "Renamed");
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let room = spawn_room("d1", &["u1", "u2"]);
        let (conn, _rx, first) = join(&room, "c1", "u1").await;
        assert_eq!(first.active_participants, vec!["u1"]);

        // Re-joining with the same connection duplicates nothing.
        let second = room
            .handle
            .join(
                "c1".to_string(),
                "u1".to_string(),
                conn,
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(second.active_participants, vec!["u1"]);

        let snapshot = room.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.member_connections, 1);
    }

    /// Store whose writes always fail; reads delegate to an in-memory
    /// store so joins still work.
    struct BrokenWriteStore {
        inner: InMemoryStore,
    }

    #[async_trait::async_trait]
    impl MessageStore for BrokenWriteStore {
        async fn save_message(
            &self,
            _message: NewMessage,
        ) -> Result<MessageRecord, crate::store::StoreError> {
            Err(crate::store::StoreError::Unavailable(
                "write replica down".to_string(),
            ))
        }

        async fn load_history(
            &self,
            dialog_id: &str,
            offset: usize,
            limit: u32,
        ) -> Result<crate::store::HistoryPage, crate::store::StoreError> {
            self.inner.load_history(dialog_id, offset, limit).await
        }

        async fn dialog_short(
            &self,
            dialog_id: &str,
        ) -> Result<messenger_protocol::dialog::DialogShort, crate::store::StoreError> {
            self.inner.dialog_short(dialog_id).await
        }

        async fn mark_delivered(
            &self,
            dialog_id: &str,
            message_id: &str,
            at: chrono::DateTime<chrono::Utc>,
        ) -> Result<Option<MessageRecord>, crate::store::StoreError> {
            self.inner.mark_delivered(dialog_id, message_id, at).await
        }

        async fn mark_read(
            &self,
            dialog_id: &str,
            message_id: &str,
            at: chrono::DateTime<chrono::Utc>,
        ) -> Result<Option<MessageRecord>, crate::store::StoreError> {
            self.inner.mark_read(dialog_id, message_id, at).await
        }
    }

    #[tokio::test]
    async fn test_failed_persist_errors_sender_and_broadcasts_nothing() {
        let inner = InMemoryStore::new();
        inner.seed_dialog("d1", "Test Dialog", &["u1", "u2"]);
        let store = Arc::new(BrokenWriteStore { inner });
        let table = Arc::new(ConnectionTable::new());
        let (registry_tx, registry_rx) = mpsc::channel(16);
        let metrics = ActorMetrics::new();

        let (handle, _task) = DialogRoomActor::spawn(
            "d1".to_string(),
            CancellationToken::new(),
            store as Arc<dyn MessageStore>,
            Arc::clone(&table),
            registry_tx,
            RoomConfig::default(),
            Arc::clone(&metrics),
        );
        let room = TestRoom {
            handle,
            store: Arc::new(InMemoryStore::new()),
            table,
            registry_rx,
            metrics,
        };

        let (_c1, mut rx1, _) = join(&room, "c1", "u1").await;
        let (_c2, mut rx2, _) = join(&room, "c2", "u2").await;
        assert!(matches!(
            next_event(&mut rx1).await,
            DialogServerEvent::UserStatusChanged { .. }
        ));

        let result = room
            .handle
            .send_message(
                "c1".to_string(),
                CreateMessage {
                    text: "lost".to_string(),
                    reply_to_id: None,
                    forwarded_from_id: None,
                },
                vec![],
            )
            .await;
        assert!(matches!(result, Err(GatewayError::PersistenceFailure(_))));

        // The peer saw nothing from the failed send: its next frame is
        // the typing indicator raised afterwards.
        room.handle
            .set_typing("c1".to_string(), true)
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut rx2).await,
            DialogServerEvent::UserTyping {
                is_typing: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_message_fans_out_exactly_once() {
        let room = spawn_room("d1", &["u1", "u2"]);
        let (_c1, mut rx1, _) = join(&room, "c1", "u1").await;
        let (_c2, mut rx2, _) = join(&room, "c2", "u2").await;

        // u1 sees u2 come online.
        let status = next_event(&mut rx1).await;
        assert!(matches!(
            status,
            DialogServerEvent::UserStatusChanged {
                status: PresenceStatus::Online,
                ..
            }
        ));

        room.handle
            .send_message(
                "c1".to_string(),
                CreateMessage {
                    text: "hi".to_string(),
                    reply_to_id: None,
                    forwarded_from_id: None,
                },
                vec![],
            )
            .await
            .unwrap();

        // Both members, sender included, get the message exactly once.
        for rx in [&mut rx1, &mut rx2] {
            let DialogServerEvent::NewMessage(record) = next_event(rx).await else {
                panic!("expected new_message");
            };
            assert_eq!(record.text, "hi");
            assert_eq!(record.author_id, "u1");
        }

        // Followed by the refreshed list-view summary.
        for rx in [&mut rx1, &mut rx2] {
            let DialogServerEvent::DialogShortUpdated(short) = next_event(rx).await else {
                panic!("expected dialog_short_updated");
            };
            assert_eq!(short.last_message.unwrap().text, "hi");
        }
    }

    #[tokio::test]
    async fn test_send_from_non_member_rejected() {
        let room = spawn_room("d1", &["u1"]);
        let result = room
            .handle
            .send_message(
                "ghost".to_string(),
                CreateMessage {
                    text: "boo".to_string(),
                    reply_to_id: None,
                    forwarded_from_id: None,
                },
                vec![],
            )
            .await;
        assert!(matches!(result, Err(GatewayError::NotAMember(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_indicator_expires() {
        let room = spawn_room("d1", &["u1", "u2"]);
        let (_c1, _rx1, _) = join(&room, "c1", "u1").await;
        let (_c2, mut rx2, _) = join(&room, "c2", "u2").await;

        room.handle.set_typing("c1".to_string(), true).await.unwrap();
        let DialogServerEvent::UserTyping { user_id, is_typing } = next_event(&mut rx2).await
        else {
            panic!("expected user_typing");
        };
        assert_eq!(user_id, "u1");
        assert!(is_typing);

        // Never stopped explicitly; the sweep expires it.
        tokio::time::advance(Duration::from_secs(15)).await;
        let DialogServerEvent::UserTyping { is_typing, .. } = next_event(&mut rx2).await else {
            panic!("expected user_typing expiry");
        };
        assert!(!is_typing);
    }

    #[tokio::test]
    async fn test_read_receipt_updates_last_message_once() {
        let room = spawn_room("d1", &["u1", "u2"]);
        let (_c1, mut rx1, _) = join(&room, "c1", "u1").await;
        let (_c2, mut rx2, _) = join(&room, "c2", "u2").await;
        let _ = next_event(&mut rx1).await; // u2 online

        room.handle
            .send_message(
                "c1".to_string(),
                CreateMessage {
                    text: "read me".to_string(),
                    reply_to_id: None,
                    forwarded_from_id: None,
                },
                vec![],
            )
            .await
            .unwrap();
        let DialogServerEvent::NewMessage(record) = next_event(&mut rx2).await else {
            panic!("expected new_message");
        };
        let _ = next_event(&mut rx1).await; // new_message
        let _ = next_event(&mut rx1).await; // dialog_short_updated
        let _ = next_event(&mut rx2).await; // dialog_short_updated

        room.handle
            .receipt("c2".to_string(), ReceiptKind::Read, vec![record.id.clone()])
            .await
            .unwrap();

        let DialogServerEvent::DialogLastMessageUpdated { last_message, .. } =
            next_event(&mut rx1).await
        else {
            panic!("expected dialog_last_message_updated");
        };
        assert!(last_message.date_read.is_some());
        assert!(last_message.date_delivered.is_some());

        // A late delivered receipt is a no-op: no further update.
        room.handle
            .receipt("c2".to_string(), ReceiptKind::Delivered, vec![record.id])
            .await
            .unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(200), rx1.recv()).await;
        assert!(quiet.is_err(), "stale receipt must not broadcast");
    }

    #[tokio::test]
    async fn test_dialog_image_change_pushed_on_next_refresh() {
        let room = spawn_room("d1", &["u1"]);
        let (_c1, mut rx1, _) = join(&room, "c1", "u1").await;

        room.handle
            .send_message(
                "c1".to_string(),
                CreateMessage {
                    text: "one".to_string(),
                    reply_to_id: None,
                    forwarded_from_id: None,
                },
                vec![],
            )
            .await
            .unwrap();
        let _ = next_event(&mut rx1).await; // new_message
        let _ = next_event(&mut rx1).await; // dialog_short_updated

        room.store.set_dialog_image("d1", Some("avatars/new.png"));
        room.handle
            .send_message(
                "c1".to_string(),
                CreateMessage {
                    text: "two".to_string(),
                    reply_to_id: None,
                    forwarded_from_id: None,
                },
                vec![],
            )
            .await
            .unwrap();
        let _ = next_event(&mut rx1).await; // new_message

        let DialogServerEvent::DialogImageUpdated { image, .. } = next_event(&mut rx1).await
        else {
            panic!("expected dialog_image_updated");
        };
        assert_eq!(image.as_deref(), Some("avatars/new.png"));
    }

    #[tokio::test]
    async fn test_empty_room_notifies_registry() {
        let mut room = spawn_room("d1", &["u1"]);
        let (_c1, _rx1, _) = join(&room, "c1", "u1").await;
        room.handle.leave("c1".to_string()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), room.registry_rx.recv())
            .await
            .expect("registry should be notified")
            .unwrap();
        assert!(matches!(
            msg,
            RegistryMessage::RoomEmpty {
                kind: RoomKind::Dialog,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_leave_without_join_rejected() {
        let room = spawn_room("d1", &["u1"]);
        let result = room.handle.leave("ghost".to_string()).await;
        assert!(matches!(result, Err(GatewayError::NotAMember(_))));
    }

    #[tokio::test]
    async fn test_last_seen_survives_leave() {
        let room = spawn_room("d1", &["u1", "u2"]);
        let (_c1, _rx1, _) = join(&room, "c1", "u1").await;
        let (_c2, _rx2, _) = join(&room, "c2", "u2").await;

        let joined_at = room.handle.snapshot().await.unwrap().last_seen["u2"];

        room.table.unregister("u2", "c2");
        room.handle.leave("c2".to_string()).await.unwrap();

        let snapshot = room.handle.snapshot().await.unwrap();
        assert!(!snapshot.active_participants.contains(&"u2".to_string()));
        assert!(snapshot.last_seen["u2"] >= joined_at);
    }
}
