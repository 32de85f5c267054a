//! Message types for the actor system.
//!
//! Requests that can fail carry a `Reply<T>` oneshot; fire-and-forget
//! notifications carry nothing. Media-plane work is split into
//! `Begin*`/`Commit*` pairs: the room validates and reserves in `Begin*`,
//! the caller performs the media-plane call outside the room, and the room
//! records the outcome in `Commit*`. The room's mailbox is never blocked
//! on the SFU.

use common::types::Pagination;
use tokio::sync::oneshot;

use messenger_protocol::conference::{ParticipantSummary, PreferredLayers, ProducerKind};
use messenger_protocol::dialog::{CreateMessage, DialogServerEvent, MediaRef, MessageRecord};
use messenger_protocol::signal::Signal;

use crate::actors::conference::ConferenceRoomHandle;
use crate::actors::connection::ConnectionHandle;
use crate::actors::dialog::DialogRoomHandle;
use crate::errors::GatewayError;

/// Reply channel for requests that can fail.
pub type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

/// Messages handled by `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Deliver an encoded frame to the client.
    Deliver { frame: String },
}

/// Receipt kind for message state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// Reply to a dialog join: one history page plus room state.
#[derive(Debug)]
pub struct DialogJoinReply {
    pub messages: Vec<MessageRecord>,
    /// Persisted dialog membership.
    pub participants: Vec<String>,
    /// Users with at least one live connection in the room.
    pub active_participants: Vec<String>,
}

/// Test/introspection snapshot of a dialog room.
#[derive(Debug)]
pub struct DialogRoomSnapshot {
    pub member_connections: usize,
    pub active_participants: Vec<String>,
    pub typing_users: Vec<String>,
    /// When each user was last active in the room.
    pub last_seen: std::collections::HashMap<String, chrono::DateTime<chrono::Utc>>,
}

/// Messages handled by `DialogRoomActor`.
#[derive(Debug)]
pub enum DialogRoomMessage {
    /// A connection joins the room. Idempotent: re-joining returns a
    /// fresh history page without duplicating membership.
    Join {
        connection_id: String,
        user_id: String,
        connection: ConnectionHandle,
        pagination: Pagination,
        respond_to: Reply<DialogJoinReply>,
    },
    /// A connection leaves the room explicitly.
    Leave {
        connection_id: String,
        respond_to: Reply<()>,
    },
    /// A connection dropped without leaving.
    Disconnected { connection_id: String },
    /// Persist and fan out a message.
    Send {
        connection_id: String,
        message: CreateMessage,
        media: Vec<MediaRef>,
        respond_to: Reply<()>,
    },
    /// Typing indicator on/off.
    SetTyping {
        connection_id: String,
        is_typing: bool,
        respond_to: Reply<()>,
    },
    /// Delivery/read receipts for a batch of messages.
    Receipt {
        connection_id: String,
        kind: ReceiptKind,
        message_ids: Vec<String>,
        respond_to: Reply<()>,
    },
    /// Whether the given user has a live connection in this room.
    IsMember {
        user_id: String,
        respond_to: oneshot::Sender<bool>,
    },
    /// Fan an event out to every member connection.
    Broadcast { event: DialogServerEvent },
    /// Introspection for tests and the status endpoint.
    Snapshot {
        respond_to: oneshot::Sender<DialogRoomSnapshot>,
    },
}

/// Reply to a conference join: the current roster, excluding the joiner.
#[derive(Debug)]
pub struct ConferenceJoinReply {
    pub participants: Vec<ParticipantSummary>,
}

/// Grant to create a consumer, returned by `BeginConsume`.
#[derive(Debug)]
pub struct ConsumeGrant {
    pub transport_id: String,
    pub producer_user_id: String,
    pub kind: ProducerKind,
}

/// Media-plane resources released by a teardown; the caller closes them
/// against the SFU after the room has forgotten them.
#[derive(Debug, Default)]
pub struct ReleasedMedia {
    pub transport_id: Option<String>,
    pub producer_ids: Vec<String>,
    pub consumer_ids: Vec<String>,
}

impl ReleasedMedia {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transport_id.is_none() && self.producer_ids.is_empty() && self.consumer_ids.is_empty()
    }
}

/// Test/introspection snapshot of a conference room.
#[derive(Debug)]
pub struct ConferenceSnapshot {
    pub participants: Vec<ParticipantSummary>,
}

/// Messages handled by `ConferenceRoomActor`.
#[derive(Debug)]
pub enum ConferenceRoomMessage {
    /// A participant joins. Dialog membership is checked upstream by the
    /// registry; joining twice is a conflict.
    Join {
        user_id: String,
        connection_id: String,
        connection: ConnectionHandle,
        respond_to: Reply<ConferenceJoinReply>,
    },
    /// Record the transport allocated for a participant at join time.
    SetTransport {
        user_id: String,
        transport_id: String,
        respond_to: Reply<()>,
    },
    /// Validate a transport-connect attempt; returns the transport id.
    BeginConnect {
        user_id: String,
        respond_to: Reply<String>,
    },
    /// Mark the participant's transport as negotiated.
    CommitConnect {
        user_id: String,
        respond_to: Reply<()>,
    },
    /// Validate a produce attempt; returns the transport id to produce on.
    BeginProduce {
        user_id: String,
        kind: ProducerKind,
        respond_to: Reply<String>,
    },
    /// Register a created producer and announce it to peers.
    CommitProduce {
        user_id: String,
        kind: ProducerKind,
        producer_id: String,
        respond_to: Reply<()>,
    },
    /// Validate a consume attempt against a live producer.
    BeginConsume {
        user_id: String,
        producer_id: String,
        respond_to: Reply<ConsumeGrant>,
    },
    /// Register a created consumer. It starts paused.
    CommitConsume {
        user_id: String,
        producer_id: String,
        consumer_id: String,
        respond_to: Reply<ProducerKind>,
    },
    /// Pause media flow on one of the caller's consumers.
    PauseConsumer {
        user_id: String,
        consumer_id: String,
        respond_to: Reply<()>,
    },
    /// Resume media flow on one of the caller's consumers.
    ResumeConsumer {
        user_id: String,
        consumer_id: String,
        respond_to: Reply<()>,
    },
    /// Record an SVC layer preference; returns the consumed producer id.
    SetPreferredLayers {
        user_id: String,
        consumer_id: String,
        layers: PreferredLayers,
        respond_to: Reply<String>,
    },
    /// Route a signal. `moderator` reflects the caller's role, checked
    /// upstream before the message was sent. A kick returns the target's
    /// released media for the caller to close.
    Relay {
        from_user_id: String,
        signal: Signal,
        moderator: bool,
        respond_to: Reply<ReleasedMedia>,
    },
    /// A participant leaves explicitly.
    Leave {
        user_id: String,
        respond_to: Reply<ReleasedMedia>,
    },
    /// A connection dropped without leaving.
    Disconnected {
        connection_id: String,
        respond_to: oneshot::Sender<ReleasedMedia>,
    },
    /// Introspection for tests and the status endpoint.
    Snapshot {
        respond_to: oneshot::Sender<ConferenceSnapshot>,
    },
}

/// Which map a room lives in at the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Dialog,
    Conference,
}

/// Registry status for the readiness endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub dialog_rooms: usize,
    pub conference_rooms: usize,
    pub draining: bool,
}

/// Messages handled by `RegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Get or create the dialog room for a dialog.
    DialogRoom {
        dialog_id: String,
        respond_to: Reply<DialogRoomHandle>,
    },
    /// Look up a dialog room without creating it.
    FindDialogRoom {
        dialog_id: String,
        respond_to: oneshot::Sender<Option<DialogRoomHandle>>,
    },
    /// Get or create the conference room for a dialog. The caller has
    /// already verified the user's dialog membership; on first creation
    /// the registry announces the conference to the dialog room.
    ConferenceRoom {
        dialog_id: String,
        user_id: String,
        respond_to: Reply<ConferenceRoomHandle>,
    },
    /// A room reports that its last member left.
    RoomEmpty { dialog_id: String, kind: RoomKind },
    /// A connection closed; sweep it out of every room. Replies with the
    /// media released by conference sweeps.
    ConnectionClosed {
        connection_id: String,
        respond_to: oneshot::Sender<Vec<ReleasedMedia>>,
    },
    /// Registry status for the readiness endpoint.
    Status {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
    /// Stop accepting new rooms and tear down the existing ones.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}
