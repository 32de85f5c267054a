//! The gateway's actor system.
//!
//! Single-writer state, no shared locks: every piece of mutable room
//! state is owned by exactly one tokio task and reached through an mpsc
//! mailbox. The hierarchy is
//!
//! ```text
//! RegistryActor (singleton)
//!   ├── DialogRoomActor      (one per live dialog)
//!   └── ConferenceRoomActor  (one per live conference)
//! ConnectionActor            (one per WebSocket connection)
//! ```
//!
//! Cancellation tokens flow down the hierarchy; cancelling the registry
//! tears down every room.

pub mod conference;
pub mod connection;
pub mod dialog;
pub mod messages;
pub mod metrics;
pub mod registry;
