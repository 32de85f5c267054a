//! Event fan-out helpers.
//!
//! Events are encoded once per fan-out and the same frame is handed to
//! every member connection. Delivery is per-connection best effort; a
//! slow or dead connection never blocks the others.

use serde::Serialize;
use tracing::error;

use messenger_protocol::codec;
use messenger_protocol::conference::ConferenceServerEvent;
use messenger_protocol::dialog::DialogServerEvent;

use crate::actors::connection::ConnectionHandle;
use crate::errors::GatewayError;

/// Send one event to one connection.
pub fn send_event<T: Serialize>(connection: &ConnectionHandle, event: &T) {
    match codec::encode_frame(event) {
        Ok(frame) => connection.deliver(frame),
        Err(err) => {
            error!(
                target: "gw.presence",
                connection_id = %connection.connection_id(),
                error = %err,
                "Failed to encode outbound event"
            );
        }
    }
}

/// Fan one event out to many connections, encoding it once.
pub fn broadcast_event<'a, T, I>(connections: I, event: &T)
where
    T: Serialize,
    I: IntoIterator<Item = &'a ConnectionHandle>,
{
    let frame = match codec::encode_frame(event) {
        Ok(frame) => frame,
        Err(err) => {
            error!(
                target: "gw.presence",
                error = %err,
                "Failed to encode broadcast event"
            );
            return;
        }
    };

    for connection in connections {
        connection.deliver(frame.clone());
    }
}

/// The dialog-namespace rejection event for an error.
#[must_use]
pub fn dialog_error(err: &GatewayError) -> DialogServerEvent {
    DialogServerEvent::Error {
        message: err.client_message(),
        error: err.wire_tag().to_string(),
    }
}

/// The conference-namespace rejection event for an error.
#[must_use]
pub fn conference_error(err: &GatewayError) -> ConferenceServerEvent {
    ConferenceServerEvent::Error {
        message: err.client_message(),
        error: err.wire_tag().to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_error_events_carry_wire_tag() {
        let event = dialog_error(&GatewayError::NotAMember("d1".to_string()));
        let DialogServerEvent::Error { error, message } = event else {
            panic!("expected error event");
        };
        assert_eq!(error, "not_a_member");
        assert!(!message.contains("d1"));
    }
}
