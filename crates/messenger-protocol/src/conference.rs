//! Conference namespace events.
//!
//! The conference protocol is request/response per connection: a client
//! negotiates its transport (`connect_transport`), then registers producers
//! and consumers against the SFU media plane. Consumers start paused and
//! must be explicitly resumed once the client's renderer is ready.

use crate::signal::Signal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of media a producer carries. Screen-share is its own kind: a
/// participant may hold a camera producer and a screen producer at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    Audio,
    Video,
    Screen,
}

/// A registered producer as seen by peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    /// Producer id assigned by the media plane.
    pub producer_id: String,
    /// Owning participant's user id.
    pub user_id: String,
    /// Media kind.
    pub kind: ProducerKind,
}

/// A conference participant as seen by peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    /// User id.
    pub user_id: String,
    /// Whether the participant's audio is enabled.
    pub audio_enabled: bool,
    /// Whether the participant's video is enabled.
    pub video_enabled: bool,
    /// The participant's live producers.
    #[serde(default)]
    pub producers: Vec<ProducerInfo>,
}

/// SVC quality-layer preference for a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredLayers {
    /// Spatial layer (resolution tier).
    pub spatial_layer: u8,
    /// Temporal layer (frame-rate tier).
    pub temporal_layer: u8,
}

/// Client -> server events on the `/conference` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ConferenceClientEvent {
    /// Join the conference of a dialog (requires dialog membership).
    JoinConference { dialog_id: String },
    /// Leave the conference.
    LeaveConference { dialog_id: String },
    /// Complete transport negotiation (DTLS/ICE parameters are opaque to
    /// the gateway; the media plane interprets them).
    ConnectTransport {
        dialog_id: String,
        dtls_parameters: Value,
    },
    /// Register a producer for the given media kind.
    Produce {
        dialog_id: String,
        kind: ProducerKind,
        rtp_parameters: Value,
    },
    /// Subscribe to a peer's producer. The consumer starts paused.
    Consume {
        dialog_id: String,
        producer_id: String,
    },
    /// Pause media flow on a consumer without renegotiation.
    PauseConsumer {
        dialog_id: String,
        consumer_id: String,
    },
    /// Resume media flow on a consumer.
    ResumeConsumer {
        dialog_id: String,
        consumer_id: String,
    },
    /// Request SVC layers for a consumer. Purely an optimization hint.
    SetPreferredLayers {
        dialog_id: String,
        consumer_id: String,
        #[serde(flatten)]
        layers: PreferredLayers,
    },
    /// Relay a signal to the other participants.
    Signal { dialog_id: String, signal: Signal },
}

/// Server -> client events on the `/conference` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ConferenceServerEvent {
    /// Reply to the joiner: current roster and live producers.
    ConferenceJoined {
        dialog_id: String,
        participants: Vec<ParticipantSummary>,
    },
    /// A participant joined.
    UserJoined { user_id: String },
    /// A participant left; their producers and your consumers of them are
    /// already torn down when this arrives.
    UserLeft { user_id: String },
    /// Transport negotiation completed; produce/consume now accepted.
    TransportConnected { dialog_id: String },
    /// Reply to `produce`.
    ProducerCreated {
        producer_id: String,
        kind: ProducerKind,
    },
    /// A peer registered a new producer; consume it if interested.
    NewProducer {
        user_id: String,
        producer_id: String,
        kind: ProducerKind,
    },
    /// Reply to `consume`. The consumer starts paused.
    ConsumerCreated {
        consumer_id: String,
        producer_id: String,
        kind: ProducerKind,
        paused: bool,
    },
    /// A consumer of yours was closed because its producer went away.
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },
    /// A peer started sharing their screen.
    ScreenShareStarted {
        user_id: String,
        producer_id: String,
    },
    /// A peer stopped sharing their screen.
    ScreenShareStopped {
        user_id: String,
        producer_id: String,
    },
    /// SVC layers changed on a producer (hint echo; may be a no-op).
    VideoQualityChanged {
        producer_id: String,
        #[serde(flatten)]
        layers: PreferredLayers,
    },
    /// A relayed signal from a peer.
    Signal { from_user_id: String, signal: Signal },
    /// The conference ended (last participant left or room torn down).
    ConferenceEnded,
    /// Rejection returned only to the originating connection.
    Error { message: String, error: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_produce_wire_shape() {
        let json_text = r#"{
            "event": "produce",
            "data": {
                "dialog_id": "d1",
                "kind": "screen",
                "rtp_parameters": {"codecs": []}
            }
        }"#;
        let event: ConferenceClientEvent = serde_json::from_str(json_text).unwrap();
        assert!(matches!(
            event,
            ConferenceClientEvent::Produce {
                kind: ProducerKind::Screen,
                ..
            }
        ));
    }

    #[test]
    fn test_preferred_layers_flatten() {
        let event = ConferenceClientEvent::SetPreferredLayers {
            dialog_id: "d1".to_string(),
            consumer_id: "c1".to_string(),
            layers: PreferredLayers {
                spatial_layer: 2,
                temporal_layer: 1,
            },
        };
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"spatial_layer\":2"));
        assert!(encoded.contains("\"temporal_layer\":1"));
    }

    #[test]
    fn test_new_producer_roundtrip() {
        let event = ConferenceServerEvent::NewProducer {
            user_id: "u1".to_string(),
            producer_id: "p1".to_string(),
            kind: ProducerKind::Video,
        };
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: ConferenceServerEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_signal_relay_event() {
        let event = ConferenceClientEvent::Signal {
            dialog_id: "d1".to_string(),
            signal: Signal::Offer {
                sdp: "v=0...".to_string(),
            },
        };
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["event"], json!("signal"));
        assert_eq!(encoded["data"]["signal"]["type"], json!("offer"));
    }
}
