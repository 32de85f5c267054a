//! Gateway error types.
//!
//! Every failure mode in this subsystem degrades to a per-connection
//! `error { message, error }` event; nothing here is fatal to the process.
//! Internal details are logged server-side but never exposed to clients.

use thiserror::Error;

/// Gateway error type.
///
/// `error_code()` gives the stable numeric code used in logs and metrics;
/// `wire_tag()` gives the string carried in the `error` field of the wire
/// event; `client_message()` is the human-readable text, scrubbed of
/// internals.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Handshake identity missing or malformed; connection refused.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Action on a room the caller has not joined.
    #[error("Not a member of dialog {0}")]
    NotAMember(String),

    /// Media operation before transport negotiation completed.
    #[error("Transport not ready")]
    TransportNotReady,

    /// Moderator action without the moderator role.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Consume referenced a producer never registered in this room.
    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    /// Operation referenced a consumer the caller does not hold.
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    /// External store did not answer within the bound.
    #[error("Persistence timeout")]
    PersistenceTimeout,

    /// External store failed.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Conflicting state (e.g. joining a conference twice).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Room does not exist.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Gateway is draining (graceful shutdown).
    #[error("Gateway is draining")]
    Draining,

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable numeric error code for logs and metrics.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            GatewayError::Unauthenticated(_) => 1,
            GatewayError::NotAMember(_) => 2,
            GatewayError::Forbidden(_) => 3,
            GatewayError::RoomNotFound(_) => 4,
            GatewayError::Conflict(_) => 5,
            GatewayError::TransportNotReady => 6,
            GatewayError::UnknownProducer(_) => 7,
            GatewayError::UnknownConsumer(_) => 8,
            GatewayError::PersistenceTimeout => 9,
            GatewayError::PersistenceFailure(_) => 10,
            GatewayError::Draining => 11,
            GatewayError::Internal(_) => 12,
        }
    }

    /// String tag carried in the `error` field of the wire event.
    #[must_use]
    pub fn wire_tag(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::NotAMember(_) => "not_a_member",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::RoomNotFound(_) => "room_not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::TransportNotReady => "transport_not_ready",
            GatewayError::UnknownProducer(_) => "unknown_producer",
            GatewayError::UnknownConsumer(_) => "unknown_consumer",
            GatewayError::PersistenceTimeout => "persistence_timeout",
            GatewayError::PersistenceFailure(_) => "persistence_failure",
            GatewayError::Draining => "draining",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Unauthenticated(_) => "Authentication required".to_string(),
            GatewayError::NotAMember(_) => "You are not a member of this dialog".to_string(),
            GatewayError::TransportNotReady => {
                "Transport negotiation has not completed".to_string()
            }
            GatewayError::Forbidden(_) => "You do not have permission to do that".to_string(),
            GatewayError::UnknownProducer(_) => "Unknown producer".to_string(),
            GatewayError::UnknownConsumer(_) => "Unknown consumer".to_string(),
            GatewayError::PersistenceTimeout | GatewayError::PersistenceFailure(_) => {
                "Message could not be saved, please retry".to_string()
            }
            GatewayError::Conflict(msg) => msg.clone(),
            GatewayError::RoomNotFound(_) => "Room not found".to_string(),
            GatewayError::Draining => "Server is shutting down, please reconnect".to_string(),
            GatewayError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
