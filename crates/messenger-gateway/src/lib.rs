//! Messenger Gateway Library
//!
//! Core functionality for the messenger gateway - a stateful WebSocket
//! server responsible for:
//!
//! - Real-time dialog messaging (history, fan-out, typing, receipts)
//! - Presence tracking across multiple connections per user
//! - Video conference signaling against an external SFU
//! - Graceful shutdown with connection draining
//!
//! # Architecture
//!
//! The gateway uses an actor model hierarchy:
//!
//! ```text
//! RegistryActor (singleton per instance)
//! ├── DialogRoomActor      (one per live dialog)
//! ├── ConferenceRoomActor  (one per live conference)
//! └── ConnectionActor      (one per WebSocket connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Rooms are ephemeral**: A room actor exists only while it has
//!   members; persisted membership lives behind [`store::MessageStore`].
//! - **Rooms never touch the SFU**: Media-plane calls run in the
//!   per-connection task between `begin_*`/`commit_*` exchanges.
//! - **Slow clients are disconnected**: Outbound fan-out never blocks a
//!   room; a full connection mailbox cancels that connection.
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`gateway`] - WebSocket endpoints and event dispatch
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire tags and error codes

pub mod actors;
pub mod auth;
pub mod config;
pub mod connections;
pub mod errors;
pub mod gateway;
pub mod media;
pub mod observability;
pub mod presence;
pub mod store;
