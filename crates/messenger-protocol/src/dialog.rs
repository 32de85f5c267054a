//! Dialog namespace events and message read-models.
//!
//! A message moves through `Sent -> Delivered -> Read`. Transitions are
//! monotonic: a receipt can skip forward (read implies delivered) but can
//! never regress, and stale receipts are no-ops. The transition logic lives
//! on [`MessageRecord`] so the gateway and its tests share one
//! implementation.

use chrono::{DateTime, Utc};
use common::types::PresenceStatus;
use serde::{Deserialize, Serialize};

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still image.
    Image,
    /// Voice note.
    Voice,
    /// Video clip.
    Video,
    /// Generic file attachment.
    File,
}

/// Reference to an already-uploaded media object (upload itself is an
/// upstream CRUD concern; the pipeline only carries the reference).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Media object id in the upstream store.
    pub id: String,
    /// Public URL of the media object.
    pub url: String,
    /// Media kind.
    pub kind: MediaKind,
}

/// Client payload for creating a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessage {
    /// Message text.
    pub text: String,
    /// Message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// Original message this one was forwarded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from_id: Option<String>,
}

/// Delivery state of a message, derived from its receipt timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Persisted and fanned out, no receipts yet.
    Sent,
    /// At least one recipient acknowledged delivery.
    Delivered,
    /// At least one recipient read it.
    Read,
}

/// A persisted message as pushed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message id.
    pub id: String,
    /// Owning dialog id.
    pub dialog_id: String,
    /// Author user id.
    pub author_id: String,
    /// Message text.
    pub text: String,
    /// Attached media references.
    #[serde(default)]
    pub media: Vec<MediaRef>,
    /// Message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// Original message this one was forwarded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from_id: Option<String>,
    /// How many times this message has been forwarded.
    #[serde(default)]
    pub forward_count: u32,
    /// Creation timestamp.
    pub date_created: DateTime<Utc>,
    /// Delivery receipt timestamp, if delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_delivered: Option<DateTime<Utc>>,
    /// Read receipt timestamp, if read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_read: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// Current delivery status.
    #[must_use]
    pub fn status(&self) -> MessageStatus {
        if self.date_read.is_some() {
            MessageStatus::Read
        } else if self.date_delivered.is_some() {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }

    /// Apply a delivery receipt. Returns `true` if the record changed.
    ///
    /// A delivery receipt after a read receipt is a no-op: read already
    /// implies delivered and the state never regresses.
    pub fn apply_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.date_read.is_some() || self.date_delivered.is_some() {
            return false;
        }
        self.date_delivered = Some(at);
        true
    }

    /// Apply a read receipt. Returns `true` if the record changed.
    ///
    /// Read implies delivered: if no delivery receipt arrived first, the
    /// delivery timestamp is set to the read timestamp.
    pub fn apply_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.date_read.is_some() {
            return false;
        }
        if self.date_delivered.is_none() {
            self.date_delivered = Some(at);
        }
        self.date_read = Some(at);
        true
    }
}

/// Dialog type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    /// 1:1 dialog.
    Private,
    /// Group dialog.
    Public,
}

/// Full dialog entity as pushed on metadata edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogEntity {
    /// Dialog id.
    pub id: String,
    /// Dialog title.
    pub title: String,
    /// Dialog image URL, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Dialog type.
    pub kind: DialogKind,
    /// Persisted dialog membership.
    pub participants: Vec<String>,
}

/// Compact dialog read-model pushed to list views so they never re-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogShort {
    /// Dialog id.
    pub id: String,
    /// Dialog title.
    pub title: String,
    /// Dialog image URL, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Dialog type.
    pub kind: DialogKind,
    /// Most recent message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageRecord>,
    /// Unread message count for the receiving user.
    #[serde(default)]
    pub unread_count: u32,
}

/// Client -> server events on the `/dialog` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DialogClientEvent {
    /// Enter a dialog room, requesting a history page.
    JoinDialog {
        dialog_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        per_page: Option<u32>,
    },
    /// Leave a dialog room.
    LeaveDialog { dialog_id: String },
    /// Send a message with optional attachments.
    SendMessage {
        dialog_id: String,
        message: CreateMessage,
        #[serde(default)]
        media: Vec<MediaRef>,
        #[serde(default)]
        voices: Vec<MediaRef>,
        #[serde(default)]
        videos: Vec<MediaRef>,
    },
    /// Typing indicator on.
    StartTyping { dialog_id: String },
    /// Typing indicator off.
    StopTyping { dialog_id: String },
    /// Delivery receipts for a batch of messages.
    MessageDelivered {
        dialog_id: String,
        message_ids: Vec<String>,
    },
    /// Read receipts for a batch of messages.
    MessageRead {
        dialog_id: String,
        message_ids: Vec<String>,
    },
}

/// Server -> client events on the `/dialog` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DialogServerEvent {
    /// A new message landed in a dialog the client is a member of.
    NewMessage(MessageRecord),
    /// A member's presence changed; carries the room's active set.
    UserStatusChanged {
        user_id: String,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_participants: Option<Vec<String>>,
    },
    /// History page returned to the joining connection only.
    DialogHistory {
        messages: Vec<MessageRecord>,
        participants: Vec<String>,
        active_participants: Vec<String>,
    },
    /// The dialog's read-model changed (new message, unread count, ...).
    DialogShortUpdated(DialogShort),
    /// The dialog entity itself changed (title, image, membership).
    /// Dialog edits happen in the upstream CRUD service; it pushes this
    /// through the room's broadcast entry point, so the gateway relays
    /// but never originates it.
    DialogUpdated(DialogEntity),
    /// A receipt touched the dialog's current last message.
    DialogLastMessageUpdated {
        dialog_id: String,
        last_message: MessageRecord,
    },
    /// The dialog image actually changed.
    DialogImageUpdated {
        dialog_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    /// A member's typing state changed.
    UserTyping { user_id: String, is_typing: bool },
    /// A conference started in this dialog.
    VideoConferenceStarted {
        dialog_id: String,
        initiator_id: String,
    },
    /// The conference in this dialog ended (broadcast to the dialog room,
    /// including members who never joined the call).
    VideoConferenceEnded {
        dialog_id: String,
        initiator_id: String,
    },
    /// Rejection returned only to the originating connection.
    Error { message: String, error: String },
}
