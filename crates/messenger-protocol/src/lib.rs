//! Wire protocol for the messenger gateway.
//!
//! This crate defines the event surface of the two logical namespaces a
//! client speaks over its connection — `/dialog` (chat messaging, typing,
//! receipts, presence) and `/conference` (WebRTC/SFU signaling) — plus the
//! closed [`signal::Signal`] union relayed between call participants.
//!
//! The crate is pure: no I/O, no transport assumptions. Events are tagged
//! JSON frames (`{"event": ..., "data": ...}`) encoded and decoded through
//! [`codec`], so the protocol is testable without a live socket.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod conference;
pub mod dialog;
pub mod signal;
