//! Persistence seam for dialog messaging.
//!
//! Rooms never talk to a database directly; they go through
//! [`MessageStore`] so the storage backend can be swapped without touching
//! room logic. The bundled [`InMemoryStore`] backs local development and
//! tests. Every store call made from a room is bounded by
//! [`call_with_timeout`] so a stalled backend cannot wedge a room actor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use messenger_protocol::dialog::{DialogKind, DialogShort, MediaRef, MessageRecord};

use crate::errors::GatewayError;

/// Storage backend error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => GatewayError::PersistenceFailure(msg),
            StoreError::NotFound(msg) => GatewayError::RoomNotFound(msg),
        }
    }
}

/// A message accepted from a client, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub dialog_id: String,
    pub author_id: String,
    pub text: String,
    pub media: Vec<MediaRef>,
    pub reply_to_id: Option<String>,
    pub forwarded_from_id: Option<String>,
}

/// One page of dialog history, newest page first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Messages in ascending creation order within the page.
    pub messages: Vec<MessageRecord>,
    /// Persisted dialog membership (distinct from who is connected).
    pub participants: Vec<String>,
}

/// Persistence operations the dialog rooms depend on.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return the stored record with its assigned
    /// id and timestamp.
    async fn save_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError>;

    /// Load one page of history plus the dialog's membership.
    async fn load_history(
        &self,
        dialog_id: &str,
        offset: usize,
        limit: u32,
    ) -> Result<HistoryPage, StoreError>;

    /// Recompute the dialog's list-view summary after a change.
    async fn dialog_short(&self, dialog_id: &str) -> Result<DialogShort, StoreError>;

    /// Mark a message delivered. Returns the updated record, or `None`
    /// when the receipt was a no-op (already delivered or read).
    async fn mark_delivered(
        &self,
        dialog_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, StoreError>;

    /// Mark a message read. Marks it delivered too if it never was.
    /// Returns `None` when the receipt was a no-op.
    async fn mark_read(
        &self,
        dialog_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, StoreError>;
}

/// Moderator role lookup for conference signal gating.
#[async_trait]
pub trait ModeratorAuthority: Send + Sync {
    async fn is_moderator(&self, dialog_id: &str, user_id: &str) -> Result<bool, StoreError>;
}

/// Bound a store call so a stalled backend surfaces as
/// [`GatewayError::PersistenceTimeout`] instead of wedging the caller.
///
/// # Errors
///
/// Returns the mapped store error, or `PersistenceTimeout` on expiry.
pub async fn call_with_timeout<T, F>(bound: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(bound, fut).await {
        Ok(result) => result.map_err(GatewayError::from),
        Err(_) => Err(GatewayError::PersistenceTimeout),
    }
}

#[derive(Debug, Default)]
struct DialogState {
    title: String,
    image: Option<String>,
    kind: Option<DialogKind>,
    participants: Vec<String>,
    messages: Vec<MessageRecord>,
    unread_count: u32,
}

/// In-process store used for local development and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    dialogs: Mutex<HashMap<String, DialogState>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a dialog with its metadata and membership.
    pub fn seed_dialog(&self, dialog_id: &str, title: &str, participants: &[&str]) {
        let mut dialogs = lock(&self.dialogs);
        let state = dialogs.entry(dialog_id.to_string()).or_default();
        state.title = title.to_string();
        state.kind = Some(DialogKind::Private);
        state.participants = participants.iter().map(ToString::to_string).collect();
    }

    /// Change a dialog's image, as an out-of-band profile edit would.
    pub fn set_dialog_image(&self, dialog_id: &str, image: Option<&str>) {
        let mut dialogs = lock(&self.dialogs);
        if let Some(state) = dialogs.get_mut(dialog_id) {
            state.image = image.map(ToString::to_string);
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn save_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let mut dialogs = lock(&self.dialogs);
        let state = dialogs
            .get_mut(&message.dialog_id)
            .ok_or_else(|| StoreError::NotFound(message.dialog_id.clone()))?;

        let forward_count = message
            .forwarded_from_id
            .as_deref()
            .map_or(0, |original_id| {
                state
                    .messages
                    .iter()
                    .find(|m| m.id == original_id)
                    .map_or(1, |m| m.forward_count + 1)
            });

        let record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            dialog_id: message.dialog_id,
            author_id: message.author_id,
            text: message.text,
            media: message.media,
            reply_to_id: message.reply_to_id,
            forwarded_from_id: message.forwarded_from_id,
            forward_count,
            date_created: Utc::now(),
            date_delivered: None,
            date_read: None,
        };
        state.messages.push(record.clone());
        state.unread_count = state.unread_count.saturating_add(1);
        Ok(record)
    }

    async fn load_history(
        &self,
        dialog_id: &str,
        offset: usize,
        limit: u32,
    ) -> Result<HistoryPage, StoreError> {
        let dialogs = lock(&self.dialogs);
        let state = dialogs
            .get(dialog_id)
            .ok_or_else(|| StoreError::NotFound(dialog_id.to_string()))?;

        // Page backwards from the newest message, returning the page in
        // ascending order.
        let total = state.messages.len();
        let end = total.saturating_sub(offset);
        let start = end.saturating_sub(limit as usize);
        let messages = state
            .messages
            .get(start..end)
            .unwrap_or_default()
            .to_vec();

        Ok(HistoryPage {
            messages,
            participants: state.participants.clone(),
        })
    }

    async fn dialog_short(&self, dialog_id: &str) -> Result<DialogShort, StoreError> {
        let dialogs = lock(&self.dialogs);
        let state = dialogs
            .get(dialog_id)
            .ok_or_else(|| StoreError::NotFound(dialog_id.to_string()))?;

        Ok(DialogShort {
            id: dialog_id.to_string(),
            title: state.title.clone(),
            image: state.image.clone(),
            kind: state.kind.unwrap_or(DialogKind::Private),
            last_message: state.messages.last().cloned(),
            unread_count: state.unread_count,
        })
    }

    async fn mark_delivered(
        &self,
        dialog_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, StoreError> {
        self.apply_receipt(dialog_id, message_id, false, |record| {
            record.apply_delivered(at)
        })
    }

    async fn mark_read(
        &self,
        dialog_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, StoreError> {
        self.apply_receipt(dialog_id, message_id, true, |record| record.apply_read(at))
    }
}

impl InMemoryStore {
    fn apply_receipt(
        &self,
        dialog_id: &str,
        message_id: &str,
        clears_unread: bool,
        apply: impl FnOnce(&mut MessageRecord) -> bool,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let mut dialogs = lock(&self.dialogs);
        let state = dialogs
            .get_mut(dialog_id)
            .ok_or_else(|| StoreError::NotFound(dialog_id.to_string()))?;
        let Some(record) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return Ok(None);
        };
        if !apply(record) {
            return Ok(None);
        }
        let updated = record.clone();
        // Reading catches the reader up on everything before it.
        if clears_unread {
            state.unread_count = 0;
        }
        Ok(Some(updated))
    }
}

/// Static moderator set for local development and tests.
#[derive(Debug, Default)]
pub struct InMemoryAuthority {
    moderators: Mutex<HashSet<(String, String)>>,
}

impl InMemoryAuthority {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, dialog_id: &str, user_id: &str) {
        let mut moderators = lock(&self.moderators);
        moderators.insert((dialog_id.to_string(), user_id.to_string()));
    }
}

#[async_trait]
impl ModeratorAuthority for InMemoryAuthority {
    async fn is_moderator(&self, dialog_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let moderators = lock(&self.moderators);
        Ok(moderators.contains(&(dialog_id.to_string(), user_id.to_string())))
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn new_message(dialog_id: &str, author: &str, text: &str) -> NewMessage {
        NewMessage {
            dialog_id: dialog_id.to_string(),
            author_id: author.to_string(),
            text: text.to_string(),
            media: vec![],
            reply_to_id: None,
            forwarded_from_id: None,
        }
    }

    #[tokio::test]
    async fn test_save_then_history() {
        let store = InMemoryStore::new();
        store.seed_dialog("d1", "Pals", &["u1", "u2"]);

        store
            .save_message(new_message("d1", "u1", "hello"))
            .await
            .unwrap();
        store
            .save_message(new_message("d1", "u2", "hi back"))
            .await
            .unwrap();

        let page = store.load_history("d1", 0, 30).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].text, "hello");
        assert_eq!(page.participants, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_history_pages_backwards_from_newest() {
        let store = InMemoryStore::new();
        store.seed_dialog("d1", "Pals", &["u1"]);
        for i in 0..5 {
            store
                .save_message(new_message("d1", "u1", &format!("m{i}")))
                .await
                .unwrap();
        }

        let first = store.load_history("d1", 0, 2).await.unwrap();
        assert_eq!(
            first.messages.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["m3", "m4"]
        );

        let second = store.load_history("d1", 2, 2).await.unwrap();
        assert_eq!(
            second.messages.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
    }

    #[tokio::test]
    async fn test_dialog_short_tracks_last_message() {
        let store = InMemoryStore::new();
        store.seed_dialog("d1", "Pals", &["u1"]);
        store
            .save_message(new_message("d1", "u1", "latest"))
            .await
            .unwrap();

        let short = store.dialog_short("d1").await.unwrap();
        assert_eq!(short.title, "Pals");
        assert_eq!(short.last_message.unwrap().text, "latest");
        assert_eq!(short.unread_count, 1);
    }

    #[tokio::test]
    async fn test_receipts_are_monotonic() {
        let store = InMemoryStore::new();
        store.seed_dialog("d1", "Pals", &["u1", "u2"]);
        let saved = store
            .save_message(new_message("d1", "u1", "msg"))
            .await
            .unwrap();

        let read = store
            .mark_read("d1", &saved.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(read.date_delivered.is_some());
        assert!(read.date_read.is_some());

        // Late delivered receipt after read is a no-op.
        let late = store
            .mark_delivered("d1", &saved.id, Utc::now())
            .await
            .unwrap();
        assert!(late.is_none());
    }

    #[tokio::test]
    async fn test_read_receipt_clears_unread_count() {
        let store = InMemoryStore::new();
        store.seed_dialog("d1", "Pals", &["u1", "u2"]);
        store
            .save_message(new_message("d1", "u1", "first"))
            .await
            .unwrap();
        let last = store
            .save_message(new_message("d1", "u1", "second"))
            .await
            .unwrap();
        assert_eq!(store.dialog_short("d1").await.unwrap().unread_count, 2);

        store.mark_read("d1", &last.id, Utc::now()).await.unwrap();
        assert_eq!(store.dialog_short("d1").await.unwrap().unread_count, 0);

        // A delivered receipt alone leaves the counter untouched.
        let next = store
            .save_message(new_message("d1", "u1", "third"))
            .await
            .unwrap();
        store
            .mark_delivered("d1", &next.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.dialog_short("d1").await.unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn test_forward_count_increments() {
        let store = InMemoryStore::new();
        store.seed_dialog("d1", "Pals", &["u1"]);
        let original = store
            .save_message(new_message("d1", "u1", "origin"))
            .await
            .unwrap();

        let mut forward = new_message("d1", "u1", "origin");
        forward.forwarded_from_id = Some(original.id.clone());
        let forwarded = store.save_message(forward).await.unwrap();
        assert_eq!(forwarded.forward_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_with_timeout_expires() {
        let result: Result<(), GatewayError> =
            call_with_timeout(Duration::from_millis(100), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GatewayError::PersistenceTimeout)));
    }

    #[tokio::test]
    async fn test_moderator_authority() {
        let authority = InMemoryAuthority::new();
        authority.grant("d1", "u1");
        assert!(authority.is_moderator("d1", "u1").await.unwrap());
        assert!(!authority.is_moderator("d1", "u2").await.unwrap());
    }
}
